//! The `hello` handshake and monitoring command, and the parts of its reply this crate reads.

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    client::{options::ServerAddress, session::ClusterTime},
    cmap::{Command, Connection},
    error::Result,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// Name servers understood before `hello` existed.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Builds the command used to check a server.
///
/// `hello_ok` is what the server said last time: `Some(true)` means it understands `hello`.
/// Otherwise the legacy name is used, and a server not yet asked gets `helloOk: true` so it can
/// say whether it understands the new one.
pub(crate) fn hello_command(hello_ok: Option<bool>, client_metadata: Option<&Document>) -> Command {
    let name = match hello_ok {
        Some(true) => "hello",
        _ => LEGACY_HELLO_COMMAND_NAME,
    };
    let mut body = doc! { name: 1 };
    if hello_ok.is_none() {
        body.insert("helloOk", true);
    }
    if let Some(metadata) = client_metadata {
        body.insert("client", metadata.clone());
    }
    Command::new(name, "admin", body)
}

pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    conn.send_command(command).await?.into_hello_reply()
}

/// A parsed hello reply along with the raw document it came from.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    /// Kept for event payloads and for comparing replies field by field.
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The fields of a hello reply that drive discovery and connection setup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    pub is_writable_primary: Option<bool>,
    /// Pre-`hello` spelling of `is_writable_primary`.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,
    pub hello_ok: Option<bool>,

    // Role. See `server_type`.
    /// `"isdbgrid"` from a mongos.
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub hidden: Option<bool>,
    pub secondary: Option<bool>,
    pub arbiter_only: Option<bool>,
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    // Replica set membership as this server sees it.
    pub hosts: Option<Vec<String>>,
    pub passives: Option<Vec<String>>,
    pub arbiters: Option<Vec<String>>,
    /// The address this server has in the set's config.
    pub me: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub tags: Option<TagSet>,
    pub last_write: Option<LastWrite>,

    pub logical_session_timeout_minutes: Option<i64>,
    pub max_wire_version: Option<i32>,
    #[serde(default)]
    pub max_message_size_bytes: i32,
    /// The server's id for this connection, reported in connection events.
    pub connection_id: Option<i64>,
}

impl HelloCommandResponse {
    fn says(flag: Option<bool>) -> bool {
        flag == Some(true)
    }

    /// What kind of server sent this reply.
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }
        if self.set_name.is_none() {
            return if Self::says(self.is_replica_set) {
                ServerType::RsGhost
            } else {
                ServerType::Standalone
            };
        }

        let primary = Self::says(self.is_writable_primary) || Self::says(self.is_master);
        if Self::says(self.hidden) {
            ServerType::RsOther
        } else if primary {
            ServerType::RsPrimary
        } else if Self::says(self.secondary) {
            ServerType::RsSecondary
        } else if Self::says(self.arbiter_only) {
            ServerType::RsArbiter
        } else {
            ServerType::RsOther
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::from_document;

    fn server_type_of(reply: Document) -> ServerType {
        from_document::<HelloCommandResponse>(reply)
            .unwrap()
            .server_type()
    }

    #[test]
    fn server_type_derivation() {
        let cases = [
            (doc! { "ok": 1, "msg": "isdbgrid" }, ServerType::Mongos),
            (doc! { "ok": 1, "isWritablePrimary": true }, ServerType::Standalone),
            (
                doc! { "ok": 1, "setName": "rs", "isWritablePrimary": true },
                ServerType::RsPrimary,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "ismaster": true },
                ServerType::RsPrimary,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "secondary": true },
                ServerType::RsSecondary,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "arbiterOnly": true },
                ServerType::RsArbiter,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "secondary": true, "hidden": true },
                ServerType::RsOther,
            ),
            (doc! { "ok": 1, "setName": "rs" }, ServerType::RsOther),
            (doc! { "ok": 1, "isreplicaset": true }, ServerType::RsGhost),
        ];

        for (reply, expected) in cases {
            assert_eq!(server_type_of(reply.clone()), expected, "{}", reply);
        }
    }

    #[test]
    fn legacy_hello_negotiates_hello_ok() {
        let command = hello_command(None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(command.body.get_bool("helloOk"), Ok(true));

        let command = hello_command(Some(false), None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(!command.body.contains_key("helloOk"));

        let metadata = doc! { "application": { "name": "app" } };
        let command = hello_command(Some(true), Some(&metadata));
        assert_eq!(command.name, "hello");
        assert_eq!(command.target_db, "admin");
        assert_eq!(command.body.get_document("client"), Ok(&metadata));
    }
}
