//! An in-memory deployment that speaks OP_MSG over `tokio::io::duplex` streams. It is plugged
//! into a client through [`StreamConnector`], so every layer above the byte stream (handshake,
//! monitoring, pooling, selection, retries, cursors) runs unmodified against it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;

use crate::{
    bson::{
        doc,
        oid::ObjectId,
        spec::BinarySubtype,
        Binary,
        Bson,
        DateTime,
        Document,
        RawDocumentBuf,
        Timestamp,
    },
    bson_util,
    cmap::conn::wire::Message,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    runtime::{AsyncStream, StreamConnector},
};

const MAX_WIRE_VERSION: i32 = 17;
const DEFAULT_BATCH_SIZE: usize = 101;

/// The role a mock server reports in its hello replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockRole {
    Standalone,
    Primary,
    Secondary,
    Mongos,
}

/// What a fail point does to the command it intercepts.
#[derive(Debug, Clone)]
pub(crate) enum MockFailure {
    /// Close the connection without replying.
    Network,

    /// Reply with `ok: 0` and the given code.
    Command { code: i32, labels: Vec<String> },
}

/// A command received by any server of the deployment.
#[derive(Debug, Clone)]
pub(crate) struct LoggedCommand {
    pub(crate) address: ServerAddress,
    pub(crate) name: String,
    pub(crate) body: Document,
}

#[derive(Debug)]
struct FailPoint {
    command: String,
    remaining: u32,
    failure: MockFailure,
}

#[derive(Debug)]
struct MockHost {
    role: MockRole,
    rtt: Duration,
    down: bool,
}

#[derive(Debug, Default)]
struct MockCollection {
    documents: Vec<Document>,
}

#[derive(Debug)]
struct MockCursor {
    ns: String,
    address: ServerAddress,
    filter: Document,
    /// Index of the next document of the collection to examine.
    position: usize,
    remaining: Option<usize>,
    tailable: bool,
    await_data: bool,
}

impl MockCursor {
    fn take_batch(&mut self, documents: &[Document], batch_size: Option<usize>) -> Vec<Document> {
        let mut max = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if let Some(remaining) = self.remaining {
            max = max.min(remaining);
        }

        let mut batch = Vec::new();
        while self.position < documents.len() && batch.len() < max {
            let doc = &documents[self.position];
            self.position += 1;
            if matches_filter(&self.filter, doc) {
                batch.push(doc.clone());
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= batch.len();
        }
        batch
    }

    fn is_finished(&self, documents: &[Document]) -> bool {
        if self.remaining == Some(0) {
            return true;
        }
        !self.tailable
            && !documents
                .iter()
                .skip(self.position)
                .any(|doc| matches_filter(&self.filter, doc))
    }
}

#[derive(Debug)]
struct DeploymentState {
    set_name: Option<String>,
    hosts: Vec<(ServerAddress, MockHost)>,
    collections: HashMap<String, MockCollection>,
    cursors: HashMap<i64, MockCursor>,
    next_cursor_id: i64,
    fail_points: Vec<FailPoint>,
    command_delays: HashMap<String, Duration>,
    command_log: Vec<LoggedCommand>,
    handshake_log: Vec<LoggedCommand>,
    clock: u32,
    next_connection_id: i64,
}

impl DeploymentState {
    fn host(&self, address: &ServerAddress) -> Option<&MockHost> {
        self.hosts
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, host)| host)
    }

    fn host_mut(&mut self, address: &ServerAddress) -> &mut MockHost {
        self.hosts
            .iter_mut()
            .find(|(a, _)| a == address)
            .map(|(_, host)| host)
            .unwrap_or_else(|| panic!("{} is not part of the mock deployment", address))
    }

    fn cluster_time(&self) -> Timestamp {
        Timestamp {
            time: self.clock,
            increment: 1,
        }
    }

    /// Appends `$clusterTime` and `operationTime` to replies from replica set members, as real
    /// replica sets do.
    fn finish_reply(&self, mut reply: Document) -> Document {
        if self.set_name.is_some() {
            reply.insert(
                "$clusterTime",
                doc! {
                    "clusterTime": self.cluster_time(),
                    "signature": {
                        "hash": Binary { subtype: BinarySubtype::Generic, bytes: vec![0; 20] },
                        "keyId": 0_i64,
                    },
                },
            );
            reply.insert("operationTime", self.cluster_time());
        }
        reply
    }

    fn take_fail_point(&mut self, command: &str) -> Option<MockFailure> {
        let index = self
            .fail_points
            .iter()
            .position(|fp| fp.command == command && fp.remaining > 0)?;
        let fail_point = &mut self.fail_points[index];
        fail_point.remaining -= 1;
        let failure = fail_point.failure.clone();
        if fail_point.remaining == 0 {
            self.fail_points.remove(index);
        }
        Some(failure)
    }

    fn handle(&mut self, address: &ServerAddress, connection_id: i64, body: Document) -> Outcome {
        let Some(host) = self.host(address) else {
            return Outcome::Close;
        };
        if host.down {
            return Outcome::Close;
        }
        let rtt = host.rtt;

        let name = bson_util::first_key(&body)
            .unwrap_or_default()
            .to_lowercase();
        let entry = LoggedCommand {
            address: address.clone(),
            name: name.clone(),
            body: body.clone(),
        };
        match name.as_str() {
            // only the opening hello of a connection carries client metadata.
            "hello" | "ismaster" if body.contains_key("client") => self.handshake_log.push(entry),
            "hello" | "ismaster" => {}
            _ => self.command_log.push(entry),
        }

        let mut delay = rtt + self.command_delays.get(&name).copied().unwrap_or_default();

        let reply = match self.take_fail_point(&name) {
            Some(MockFailure::Network) => return Outcome::Close,
            Some(MockFailure::Command { code, labels }) => doc! {
                "ok": 0,
                "code": code,
                "codeName": "MockFailure",
                "errmsg": format!("fail point triggered for {}", name),
                "errorLabels": labels,
            },
            None => match name.as_str() {
                "hello" | "ismaster" => self.hello_reply(address, connection_id),
                "ping" => doc! { "ok": 1 },
                "find" => self.find(address, &body),
                "getmore" => {
                    let (reply, await_time) = self.get_more(address, &body);
                    delay += await_time;
                    reply
                }
                "killcursors" => self.kill_cursors(&body),
                "insert" => self.insert(address, &body),
                other => command_error(
                    59,
                    "CommandNotFound",
                    format!("no such command: '{}'", other),
                ),
            },
        };

        Outcome::Reply {
            reply: self.finish_reply(reply),
            delay,
        }
    }

    fn hello_reply(&self, address: &ServerAddress, connection_id: i64) -> Document {
        let role = self
            .host(address)
            .map(|h| h.role)
            .unwrap_or(MockRole::Standalone);
        let mut reply = doc! {
            "helloOk": true,
            "isWritablePrimary": matches!(role, MockRole::Standalone | MockRole::Primary | MockRole::Mongos),
            "maxWireVersion": MAX_WIRE_VERSION,
            "minWireVersion": 0,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
            "logicalSessionTimeoutMinutes": 30,
            "connectionId": connection_id,
            "ok": 1,
        };

        match role {
            MockRole::Mongos => {
                reply.insert("msg", "isdbgrid");
            }
            MockRole::Primary | MockRole::Secondary => {
                if let Some(ref set_name) = self.set_name {
                    reply.insert("setName", set_name.clone());
                }
                let hosts: Vec<String> = self.hosts.iter().map(|(a, _)| a.to_string()).collect();
                reply.insert("hosts", hosts);
                reply.insert("me", address.to_string());
                reply.insert("setVersion", 1);
                reply.insert("secondary", role == MockRole::Secondary);
                reply.insert("lastWrite", doc! { "lastWriteDate": DateTime::now() });
                if let Some((primary, _)) = self
                    .hosts
                    .iter()
                    .find(|(_, host)| host.role == MockRole::Primary && !host.down)
                {
                    reply.insert("primary", primary.to_string());
                }
                if role == MockRole::Primary {
                    reply.insert("electionId", ObjectId::from_bytes([0x7f; 12]));
                }
            }
            MockRole::Standalone => {}
        }

        reply
    }

    fn find(&mut self, address: &ServerAddress, body: &Document) -> Document {
        let ns = namespace(body, "find");
        let filter = body.get_document("filter").cloned().unwrap_or_default();
        let single_batch = body.get_bool("singleBatch").unwrap_or(false);
        let batch_size = body
            .get("batchSize")
            .and_then(bson_util::get_int)
            .filter(|size| *size > 0)
            .map(|size| size as usize);
        let limit = body
            .get("limit")
            .and_then(bson_util::get_int)
            .filter(|limit| *limit != 0)
            .map(|limit| limit.unsigned_abs() as usize);
        let skip = body
            .get("skip")
            .and_then(bson_util::get_int)
            .unwrap_or(0) as usize;

        let documents = self
            .collections
            .get(&ns)
            .map(|c| c.documents.clone())
            .unwrap_or_default();

        let mut cursor = MockCursor {
            ns: ns.clone(),
            address: address.clone(),
            filter,
            position: 0,
            remaining: limit,
            tailable: body.get_bool("tailable").unwrap_or(false),
            await_data: body.get_bool("awaitData").unwrap_or(false),
        };

        let mut skipped = 0;
        while skipped < skip && cursor.position < documents.len() {
            if matches_filter(&cursor.filter, &documents[cursor.position]) {
                skipped += 1;
            }
            cursor.position += 1;
        }

        let first_batch = cursor.take_batch(&documents, batch_size);
        // a tailable cursor over an empty collection is dead right away.
        let dead_tailable = cursor.tailable && documents.is_empty();
        let id = if single_batch || dead_tailable || cursor.is_finished(&documents) {
            0
        } else {
            let id = self.next_cursor_id;
            self.next_cursor_id += 1;
            self.cursors.insert(id, cursor);
            id
        };

        doc! {
            "cursor": { "id": id, "ns": ns, "firstBatch": first_batch },
            "ok": 1,
        }
    }

    fn get_more(&mut self, address: &ServerAddress, body: &Document) -> (Document, Duration) {
        let id = body.get_i64("getMore").unwrap_or_default();
        let batch_size = body
            .get("batchSize")
            .and_then(bson_util::get_int)
            .filter(|size| *size > 0)
            .map(|size| size as usize);
        let max_time = body
            .get("maxTimeMS")
            .and_then(bson_util::get_u64)
            .map(Duration::from_millis)
            .unwrap_or_default();

        let Some(mut cursor) = self.cursors.remove(&id) else {
            return (cursor_not_found(id), Duration::ZERO);
        };
        if &cursor.address != address {
            self.cursors.insert(id, cursor);
            return (cursor_not_found(id), Duration::ZERO);
        }

        let documents = self
            .collections
            .get(&cursor.ns)
            .map(|c| c.documents.clone())
            .unwrap_or_default();
        let batch = cursor.take_batch(&documents, batch_size);

        // an await cursor with nothing new holds the reply for its max await time.
        let await_time = if batch.is_empty() && cursor.await_data {
            max_time
        } else {
            Duration::ZERO
        };

        let ns = cursor.ns.clone();
        let id = if cursor.is_finished(&documents) {
            0
        } else {
            self.cursors.insert(id, cursor);
            id
        };

        let reply = doc! {
            "cursor": { "id": id, "ns": ns, "nextBatch": batch },
            "ok": 1,
        };
        (reply, await_time)
    }

    fn kill_cursors(&mut self, body: &Document) -> Document {
        let ids: Vec<i64> = body
            .get_array("cursors")
            .map(|ids| ids.iter().filter_map(Bson::as_i64).collect())
            .unwrap_or_default();

        let (killed, not_found): (Vec<i64>, Vec<i64>) = ids
            .into_iter()
            .partition(|id| self.cursors.remove(id).is_some());

        doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": not_found,
            "cursorsAlive": [],
            "cursorsUnknown": [],
            "ok": 1,
        }
    }

    fn insert(&mut self, address: &ServerAddress, body: &Document) -> Document {
        let writable = matches!(
            self.host(address).map(|h| h.role),
            Some(MockRole::Standalone | MockRole::Primary | MockRole::Mongos)
        );
        if !writable {
            return command_error(10107, "NotWritablePrimary", "not primary".to_string());
        }

        let ns = namespace(body, "insert");
        let ordered = body.get_bool("ordered").unwrap_or(true);
        let documents: Vec<Document> = body
            .get_array("documents")
            .map(|docs| docs.iter().filter_map(Bson::as_document).cloned().collect())
            .unwrap_or_default();

        let collection = self.collections.entry(ns).or_default();
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, document) in documents.into_iter().enumerate() {
            let duplicate = document.get("_id").is_some_and(|id| {
                collection
                    .documents
                    .iter()
                    .any(|existing| existing.get("_id") == Some(id))
            });
            if duplicate {
                write_errors.push(doc! {
                    "index": index as i32,
                    "code": 11000,
                    "errmsg": "E11000 duplicate key error",
                });
                if ordered {
                    break;
                }
            } else {
                collection.documents.push(document);
                n += 1;
            }
        }

        self.clock += 1;
        let mut reply = doc! { "n": n, "ok": 1 };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        reply
    }
}

enum Outcome {
    Reply { reply: Document, delay: Duration },
    Close,
}

/// A deployment of mock servers sharing one set of collections.
#[derive(Clone, Debug)]
pub(crate) struct MockDeployment {
    state: Arc<Mutex<DeploymentState>>,
    connections_opened: Arc<AtomicUsize>,
    connections_alive: Arc<AtomicUsize>,
}

impl MockDeployment {
    fn new(set_name: Option<String>, hosts: Vec<(ServerAddress, MockHost)>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeploymentState {
                set_name,
                hosts,
                collections: HashMap::new(),
                cursors: HashMap::new(),
                next_cursor_id: 1000,
                fail_points: Vec::new(),
                command_delays: HashMap::new(),
                command_log: Vec::new(),
                handshake_log: Vec::new(),
                clock: 1,
                next_connection_id: 1,
            })),
            connections_opened: Arc::new(AtomicUsize::new(0)),
            connections_alive: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A single standalone server at `standalone:27017`.
    pub(crate) fn standalone() -> Self {
        Self::new(
            None,
            vec![(
                ServerAddress::parse("standalone:27017").unwrap(),
                MockHost {
                    role: MockRole::Standalone,
                    rtt: Duration::ZERO,
                    down: false,
                },
            )],
        )
    }

    /// A replica set whose first host is the primary and the rest are secondaries.
    pub(crate) fn replica_set(set_name: &str, hosts: &[&str]) -> Self {
        let hosts = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| {
                let role = if i == 0 {
                    MockRole::Primary
                } else {
                    MockRole::Secondary
                };
                (
                    ServerAddress::parse(host).unwrap(),
                    MockHost {
                        role,
                        rtt: Duration::ZERO,
                        down: false,
                    },
                )
            })
            .collect();
        Self::new(Some(set_name.to_string()), hosts)
    }

    pub(crate) fn addresses(&self) -> Vec<ServerAddress> {
        self.lock().hosts.iter().map(|(a, _)| a.clone()).collect()
    }

    /// This deployment as the stream connector of a client.
    pub(crate) fn connector(&self) -> Arc<dyn StreamConnector> {
        Arc::new(self.clone())
    }

    /// Client options seeded with every host, using this deployment as the transport and a
    /// fast heartbeat so topology changes are noticed quickly.
    pub(crate) fn client_options(&self) -> ClientOptions {
        let set_name = self.lock().set_name.clone();
        let mut options = ClientOptions::builder()
            .hosts(self.addresses())
            .repl_set_name(set_name)
            .heartbeat_freq(Duration::from_millis(50))
            .server_selection_timeout(Duration::from_secs(5))
            .stream_connector(self.connector())
            .build();
        options.test_options_mut().min_heartbeat_freq = Some(Duration::from_millis(10));
        options
    }

    pub(crate) fn set_role(&self, address: &ServerAddress, role: MockRole) {
        self.lock().host_mut(address).role = role;
    }

    pub(crate) fn set_rtt(&self, address: &ServerAddress, rtt: Duration) {
        self.lock().host_mut(address).rtt = rtt;
    }

    /// A down host refuses new connections and drops existing ones on their next command.
    pub(crate) fn set_host_down(&self, address: &ServerAddress, down: bool) {
        self.lock().host_mut(address).down = down;
    }

    /// Makes the next `times` commands named `command` fail with `failure`.
    pub(crate) fn fail_next(&self, command: &str, times: u32, failure: MockFailure) {
        self.lock().fail_points.push(FailPoint {
            command: command.to_lowercase(),
            remaining: times,
            failure,
        });
    }

    /// Holds every reply to `command` for `delay` on top of the host's round trip time.
    pub(crate) fn set_command_delay(&self, command: &str, delay: Duration) {
        self.lock()
            .command_delays
            .insert(command.to_lowercase(), delay);
    }

    /// Inserts directly on the server side, bypassing any client.
    pub(crate) fn insert_documents(
        &self,
        ns: &str,
        documents: impl IntoIterator<Item = Document>,
    ) {
        let mut state = self.lock();
        state
            .collections
            .entry(ns.to_string())
            .or_default()
            .documents
            .extend(documents);
        state.clock += 1;
    }

    pub(crate) fn documents(&self, ns: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(ns)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub(crate) fn open_cursor_count(&self) -> usize {
        self.lock().cursors.len()
    }

    /// Every logged command with the given name, in the order received.
    pub(crate) fn commands_named(&self, name: &str) -> Vec<LoggedCommand> {
        let name = name.to_lowercase();
        self.lock()
            .command_log
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    /// The opening hello of every connection made so far, monitoring connections included.
    pub(crate) fn handshakes(&self) -> Vec<LoggedCommand> {
        self.lock().handshake_log.clone()
    }

    pub(crate) fn clear_command_log(&self) {
        self.lock().command_log.clear();
    }

    pub(crate) fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn connections_alive(&self) -> usize {
        self.connections_alive.load(Ordering::SeqCst)
    }

    /// The cluster time replica set members currently report.
    pub(crate) fn cluster_time(&self) -> Timestamp {
        self.lock().cluster_time()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeploymentState> {
        self.state.lock().unwrap()
    }

    async fn serve(self, address: ServerAddress, mut stream: DuplexStream) {
        let connection_id = {
            let mut state = self.lock();
            state.next_connection_id += 1;
            state.next_connection_id
        };

        loop {
            let Ok(message) = Message::read_from(&mut stream, None).await else {
                break;
            };
            let request_id = message.request_id.unwrap_or_default();
            let body = message.get_command_document();

            let outcome = self.lock().handle(&address, connection_id, body);
            let (reply, delay) = match outcome {
                Outcome::Reply { reply, delay } => (reply, delay),
                Outcome::Close => break,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let payload = RawDocumentBuf::from_document(&reply).unwrap();
            let mut message = Message::with_document(payload, None);
            message.response_to = request_id;
            if message.write_to(&mut stream).await.is_err() {
                break;
            }
        }

        self.connections_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamConnector for MockDeployment {
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
        _connect_timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<AsyncStream>> {
        Box::pin(async move {
            let reachable = self.lock().host(address).is_some_and(|host| !host.down);
            if !reachable {
                return Err(Error::network(format!(
                    "connection refused by {}",
                    address
                )));
            }

            let (client, server) = tokio::io::duplex(64 * 1024);
            self.connections_opened.fetch_add(1, Ordering::SeqCst);
            self.connections_alive.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(self.clone().serve(address.clone(), server));
            Ok(AsyncStream::new(client))
        })
    }
}

fn namespace(body: &Document, command: &str) -> String {
    format!(
        "{}.{}",
        body.get_str("$db").unwrap_or_default(),
        body.get_str(command).unwrap_or_default()
    )
}

/// Top-level equality matching; sort and projection are not modelled.
fn matches_filter(filter: &Document, doc: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

fn command_error(code: i32, code_name: &str, message: String) -> Document {
    doc! {
        "ok": 0,
        "code": code,
        "codeName": code_name,
        "errmsg": message,
    }
}

fn cursor_not_found(id: i64) -> Document {
    command_error(43, "CursorNotFound", format!("cursor id {} not found", id))
}
