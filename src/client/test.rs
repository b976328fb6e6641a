use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR},
    event::command::CommandEvent,
    operation::Find,
    options::{ClientOptions, FindOptions, InsertOptions},
    selection_criteria::{ReadPreference, SelectionCriteria},
    test::{init_tracing, EventBuffer, MockDeployment, MockFailure, MockRole},
    Client,
    Namespace,
    TopologyType,
};

const RS_HOSTS: &[&str] = &["a:27017", "b:27017", "c:27017"];

fn replica_set() -> MockDeployment {
    MockDeployment::replica_set("rs0", RS_HOSTS)
}

fn docs(range: std::ops::Range<i32>) -> Vec<Document> {
    range.map(|i| doc! { "_id": i, "x": i }).collect()
}

async fn drain(client: &Client, ns: &str) -> Vec<Document> {
    let (db, coll) = ns.split_once('.').unwrap();
    let mut cursor = client
        .find(Namespace::new(db, coll), doc! {}, None)
        .await
        .unwrap();
    let mut out = Vec::new();
    while cursor.advance().await.unwrap() {
        out.push(cursor.deserialize_current().unwrap());
    }
    out
}

#[tokio::test]
async fn replica_set_is_discovered_from_one_seed() {
    init_tracing();
    let deployment = replica_set();
    let mut options = deployment.client_options();
    options.hosts.truncate(1);

    let client = Client::with_options(options).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    let description = client.topology_description();
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.set_name(), Some("rs0"));
    let mut addresses: Vec<String> = description
        .servers()
        .map(|server| server.address().to_string())
        .collect();
    addresses.sort();
    assert_eq!(addresses, RS_HOSTS);
}

#[tokio::test]
async fn find_is_retried_once_after_network_error() {
    let deployment = replica_set();
    deployment.insert_documents("db.coll", docs(0..3));
    deployment.fail_next("find", 1, MockFailure::Network);

    let client = Client::with_options(deployment.client_options()).unwrap();
    let found = drain(&client, "db.coll").await;

    assert_eq!(found, docs(0..3));
    assert_eq!(deployment.commands_named("find").len(), 2);
}

#[tokio::test]
async fn find_is_retried_at_most_once() {
    let deployment = replica_set();
    deployment.fail_next("find", 2, MockFailure::Network);

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .find(Namespace::new("db", "coll"), doc! {}, None)
        .await
        .unwrap_err();

    assert!(error.is_network_error(), "{:?}", error);
    assert_eq!(deployment.commands_named("find").len(), 2);
}

#[tokio::test]
async fn reads_are_not_retried_when_disabled() {
    let deployment = replica_set();
    deployment.fail_next("find", 1, MockFailure::Network);

    let mut options = deployment.client_options();
    options.retry_reads = Some(false);
    let client = Client::with_options(options).unwrap();

    let error = client
        .find(Namespace::new("db", "coll"), doc! {}, None)
        .await
        .unwrap_err();
    assert!(error.is_network_error());
    assert_eq!(deployment.commands_named("find").len(), 1);
}

#[tokio::test]
async fn insert_is_retried_with_the_same_transaction_number() {
    let deployment = replica_set();
    deployment.fail_next(
        "insert",
        1,
        MockFailure::Command {
            code: 10107,
            labels: vec![],
        },
    );

    let client = Client::with_options(deployment.client_options()).unwrap();
    let result = client
        .insert(Namespace::new("db", "coll"), docs(0..2), None)
        .await
        .unwrap();
    assert_eq!(result.inserted_ids.len(), 2);

    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 2);
    let txn_numbers: Vec<_> = inserts
        .iter()
        .map(|c| c.body.get_i64("txnNumber").unwrap())
        .collect();
    assert_eq!(txn_numbers[0], txn_numbers[1]);
    assert_eq!(
        inserts[0].body.get_document("lsid").unwrap(),
        inserts[1].body.get_document("lsid").unwrap()
    );
    assert_eq!(deployment.documents("db.coll"), docs(0..2));
}

#[tokio::test]
async fn consecutive_inserts_in_a_session_use_increasing_transaction_numbers() {
    let deployment = replica_set();
    let client = Client::with_options(deployment.client_options()).unwrap();
    let mut session = client.start_session();

    for i in 0..2 {
        client
            .insert_with_session(
                Namespace::new("db", "coll"),
                docs(i..i + 1),
                None,
                &mut session,
            )
            .await
            .unwrap();
    }

    let txn_numbers: Vec<_> = deployment
        .commands_named("insert")
        .iter()
        .map(|c| c.body.get_i64("txnNumber").unwrap())
        .collect();
    assert_eq!(txn_numbers, vec![1, 2]);
}

#[tokio::test]
async fn second_retryable_write_failure_is_returned() {
    let deployment = replica_set();
    deployment.fail_next("insert", 2, MockFailure::Network);

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(deployment.commands_named("insert").len(), 2);
}

#[tokio::test]
async fn write_errors_are_not_retried() {
    let deployment = replica_set();
    deployment.insert_documents("db.coll", docs(0..1));

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap_err();

    match *error.kind {
        ErrorKind::Write(WriteFailure::WriteErrors(ref errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code, 11000);
        }
        ref other => panic!("expected write errors, got {:?}", other),
    }
    assert_eq!(deployment.commands_named("insert").len(), 1);
}

#[tokio::test]
async fn unordered_insert_reports_only_failed_documents() {
    let deployment = replica_set();
    deployment.insert_documents("db.coll", docs(1..2));

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .insert(
            Namespace::new("db", "coll"),
            docs(0..3),
            InsertOptions::builder().ordered(false).build(),
        )
        .await
        .unwrap_err();

    match *error.kind {
        ErrorKind::Write(WriteFailure::WriteErrors(ref errors)) => {
            assert_eq!(errors.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1]);
        }
        ref other => panic!("expected write errors, got {:?}", other),
    }
    assert_eq!(deployment.documents("db.coll").len(), 3);
}

#[tokio::test]
async fn standalone_writes_are_not_retried() {
    let deployment = MockDeployment::standalone();
    deployment.fail_next("insert", 1, MockFailure::Network);

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert_eq!(deployment.commands_named("insert").len(), 1);
}

#[tokio::test]
async fn run_command_is_never_retried() {
    let deployment = replica_set();
    deployment.fail_next("ping", 1, MockFailure::Network);

    let client = Client::with_options(deployment.client_options()).unwrap();
    let error = client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert_eq!(deployment.commands_named("ping").len(), 1);
}

#[tokio::test]
async fn command_failure_is_returned_as_command_error() {
    let deployment = MockDeployment::standalone();
    let client = Client::with_options(deployment.client_options()).unwrap();

    let error = client
        .run_command("admin", doc! { "notACommand": 1 }, None)
        .await
        .unwrap_err();

    match *error.kind {
        ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 59),
        ref other => panic!("expected command error, got {:?}", other),
    }
}

#[tokio::test]
async fn secondary_reads_go_to_a_secondary() {
    let deployment = replica_set();
    deployment.insert_documents("db.coll", docs(0..1));

    let client = Client::with_options(deployment.client_options()).unwrap();
    let options = FindOptions::builder()
        .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Default::default(),
        }))
        .build();
    let mut cursor = client
        .find(Namespace::new("db", "coll"), doc! {}, options)
        .await
        .unwrap();
    assert!(cursor.advance().await.unwrap());

    let finds = deployment.commands_named("find");
    assert_eq!(finds.len(), 1);
    assert_ne!(finds[0].address.to_string(), "a:27017");
}

#[tokio::test]
async fn server_selection_times_out() {
    let deployment = MockDeployment::replica_set("rs0", &["a:27017"]);
    let mut options = deployment.client_options();
    options.server_selection_timeout = Some(Duration::from_millis(200));
    let client = Client::with_options(options).unwrap();

    let error = client
        .run_command(
            "admin",
            doc! { "ping": 1 },
            SelectionCriteria::ReadPreference(ReadPreference::Secondary {
                options: Default::default(),
            }),
        )
        .await
        .unwrap_err();

    assert!(error.is_server_selection_error(), "{:?}", error);
}

#[tokio::test]
async fn new_primary_is_found_after_step_down() {
    let deployment = replica_set();
    let client = Client::with_options(deployment.client_options()).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    let a = deployment.addresses()[0].clone();
    let b = deployment.addresses()[1].clone();
    deployment.set_role(&a, MockRole::Secondary);
    deployment.set_role(&b, MockRole::Primary);
    deployment.clear_command_log();

    // the first insert hits the old primary, which refuses it; the retry finds the new one.
    client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap();

    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.last().unwrap().address, b);
}

#[tokio::test]
async fn operations_fail_after_shutdown() {
    let deployment = MockDeployment::standalone();
    let client = Client::with_options(deployment.client_options()).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    client.clone().shutdown().await;

    let error = client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown), "{:?}", error);
}

#[tokio::test]
async fn cluster_time_is_gossiped() {
    let deployment = replica_set();
    let client = Client::with_options(deployment.client_options()).unwrap();

    client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap();
    let expected = deployment.cluster_time();

    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    let ping = deployment.commands_named("ping").pop().unwrap();
    let sent = ping
        .body
        .get_document("$clusterTime")
        .unwrap()
        .get_timestamp("clusterTime")
        .unwrap();
    assert_eq!(sent, expected);
    assert_eq!(
        client
            .topology_description()
            .cluster_time()
            .map(|ct| ct.cluster_time),
        Some(expected)
    );
}

#[tokio::test]
async fn explicit_session_reads_its_own_writes() {
    let deployment = replica_set();
    let client = Client::with_options(deployment.client_options()).unwrap();
    let mut session = client.start_session();

    client
        .insert_with_session(Namespace::new("db", "coll"), docs(0..1), None, &mut session)
        .await
        .unwrap();
    let operation_time = session.operation_time().unwrap();

    let mut cursor = client
        .find_with_session(Namespace::new("db", "coll"), doc! {}, None, &mut session)
        .await
        .unwrap();
    assert!(cursor.advance().await.unwrap());

    let find = deployment.commands_named("find").pop().unwrap();
    assert_eq!(
        find.body
            .get_document("readConcern")
            .unwrap()
            .get_timestamp("afterClusterTime")
            .unwrap(),
        operation_time
    );
    assert_eq!(find.body.get_document("lsid").unwrap(), session.id());
}

#[tokio::test]
async fn implicit_sessions_are_attached_but_not_causal() {
    let deployment = replica_set();
    let client = Client::with_options(deployment.client_options()).unwrap();

    client
        .insert(Namespace::new("db", "coll"), docs(0..1), None)
        .await
        .unwrap();
    drain(&client, "db.coll").await;

    let find = deployment.commands_named("find").pop().unwrap();
    let insert = deployment.commands_named("insert").pop().unwrap();
    assert!(find.body.get_document("lsid").is_ok());
    assert!(insert.body.get_document("lsid").is_ok());
    assert_ne!(find.body.get("lsid"), insert.body.get("lsid"));
    assert!(find.body.get("readConcern").is_none());
}

#[tokio::test]
async fn command_times_out_after_deadline() {
    let deployment = MockDeployment::standalone();
    let client = Client::with_options(deployment.client_options()).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    deployment.set_command_delay("ping", Duration::from_millis(500));
    let error = client
        .run_command_with_timeout(
            "admin",
            doc! { "ping": 1 },
            None,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(error.is_network_timeout(), "{:?}", error);

    deployment.set_command_delay("ping", Duration::ZERO);
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn full_pool_wait_is_bounded_by_selection_timeout_by_default() {
    let deployment = MockDeployment::standalone();
    let mut options = deployment.client_options();
    options.max_pool_size = Some(1);
    options.server_selection_timeout = Some(Duration::from_millis(200));
    let client = Client::with_options(options).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    deployment.set_command_delay("ping", Duration::from_secs(10));
    let holder = client.clone();
    let held = tokio::spawn(async move {
        let _ = holder.run_command("admin", doc! { "ping": 1 }, None).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let error = client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(error.is_pool_timeout(), "{:?}", error);
    assert!(started.elapsed() < Duration::from_secs(5));
    held.abort();
}

#[tokio::test]
async fn retry_cut_short_by_deadline_times_out() {
    let deployment = MockDeployment::standalone();
    deployment.insert_documents("db.coll", docs(0..3));
    let client = Client::with_options(deployment.client_options()).unwrap();
    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    // the pooled connection breaks on its next command and no new one can be opened.
    deployment.set_host_down(&deployment.addresses()[0], true);
    let find = Find::new(Namespace::new("db", "coll"), doc! {}, None);
    let deadline = Instant::now() + Duration::from_millis(200);
    let error = client
        .execute_operation_with_deadline(find, None, Some(deadline))
        .await
        .unwrap_err();

    assert!(error.is_network_timeout(), "{:?}", error);
    let first = error.source.as_deref().expect("the first error is kept as the source");
    assert!(first.is_network_error(), "{:?}", first);
    assert!(!first.is_network_timeout(), "{:?}", first);
}

#[tokio::test]
async fn command_events_are_published() {
    let deployment = MockDeployment::standalone();
    let events = EventBuffer::<CommandEvent>::new();
    let mut options = deployment.client_options();
    options.command_event_handler = Some(events.handler());
    let client = Client::with_options(options).unwrap();

    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    let _ = client
        .run_command("admin", doc! { "notACommand": 1 }, None)
        .await;

    let all = events.all();
    assert_eq!(all.len(), 4);
    match (&all[0], &all[1]) {
        (CommandEvent::Started(started), CommandEvent::Succeeded(succeeded)) => {
            assert_eq!(started.command_name, "ping");
            assert_eq!(started.db, "admin");
            assert_eq!(started.request_id, succeeded.request_id);
            assert_eq!(succeeded.reply.get_i32("ok").unwrap(), 1);
        }
        other => panic!("unexpected events {:?}", other),
    }
    match &all[3] {
        CommandEvent::Failed(failed) => assert_eq!(failed.command_name, "notACommand"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn client_requires_a_runtime() {
    let options = ClientOptions::builder().build();
    assert!(Client::with_options(options).is_err());
}

#[tokio::test]
async fn first_find_batch_is_served_from_the_reply() {
    let deployment = MockDeployment::standalone();
    deployment.insert_documents("db.coll", docs(0..3));
    let client = Client::with_options(deployment.client_options()).unwrap();

    let found = drain(&client, "db.coll").await;
    assert_eq!(found.len(), 3);
    assert!(deployment.commands_named("getMore").is_empty());
}

#[tokio::test]
async fn cursor_opened_from_a_command_reply_fetches_the_rest() {
    let deployment = MockDeployment::standalone();
    deployment.insert_documents("db.coll", docs(0..5));
    let client = Client::with_options(deployment.client_options()).unwrap();

    let reply = client
        .run_command("db", doc! { "find": "coll", "batchSize": 2 }, None)
        .await
        .unwrap();
    let mut cursor = client
        .open_cursor(deployment.addresses()[0].clone(), reply)
        .unwrap();

    let mut ids = Vec::new();
    while cursor.advance().await.unwrap() {
        ids.push(cursor.deserialize_current::<Document>().unwrap().get_i32("_id").unwrap());
    }
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert!(!deployment.commands_named("getMore").is_empty());
}

#[tokio::test]
async fn reply_without_a_cursor_is_rejected() {
    let deployment = MockDeployment::standalone();
    let client = Client::with_options(deployment.client_options()).unwrap();

    let reply = client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    let error = client
        .open_cursor(deployment.addresses()[0].clone(), reply)
        .unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::InvalidResponse { .. }),
        "{:?}",
        error
    );
}
