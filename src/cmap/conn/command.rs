use serde::de::DeserializeOwned;

use super::wire::Message;
use crate::{
    bson::{Bson, Document, Timestamp},
    bson_util,
    client::session::{ClientSession, ClusterTime},
    error::{CommandError, Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// A command addressed to a database, before it is framed as an OP_MSG.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.body.insert("lsid", session.id().clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // this should never fail.
        if let Ok(doc) = crate::bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) {
        if let Ok(doc) = crate::bson::to_bson(read_preference) {
            self.body.insert("$readPreference", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    /// Makes the read observe every write up to `operation_time`, keeping any read concern
    /// level already present on the command.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        match self.body.get_document_mut("readConcern") {
            Ok(read_concern) => {
                read_concern.insert("afterClusterTime", operation_time);
            }
            Err(_) => {
                self.body.insert(
                    "readConcern",
                    crate::bson::doc! { "afterClusterTime": operation_time },
                );
            }
        }
    }
}

/// A command reply, along with the address of the server that sent it.
#[derive(Debug, Clone)]
pub(crate) struct CommandResponse {
    source: ServerAddress,
    pub(crate) raw_response: Document,
    cluster_time: Option<ClusterTime>,
}

impl CommandResponse {
    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, doc: Document) -> Self {
        let cluster_time = doc
            .get("$clusterTime")
            .and_then(|subdoc| crate::bson::from_bson(subdoc.clone()).ok());
        Self {
            source,
            raw_response: doc,
            cluster_time,
        }
    }

    pub(crate) fn new(source: ServerAddress, message: Message) -> Result<Self> {
        let raw_response = message.into_document()?;
        let cluster_time = raw_response
            .get("$clusterTime")
            .and_then(|subdoc| crate::bson::from_bson(subdoc.clone()).ok());

        Ok(Self {
            source,
            raw_response,
            cluster_time,
        })
    }

    /// `ok` is 1, in whatever numeric type the server used.
    pub(crate) fn is_success(&self) -> bool {
        self.raw_response
            .get("ok")
            .and_then(bson_util::get_int)
            .is_some_and(|ok| ok == 1)
    }

    /// Turns an `ok: 0` reply into an [`ErrorKind::Command`] error.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let command_error: CommandError = self
            .body()
            .map_err(|_| Error::invalid_response("invalid server response"))?;
        Err(Error::new(
            ErrorKind::Command(command_error),
            None::<Vec<String>>,
        ))
    }

    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_bson(Bson::Document(self.raw_response.clone()))
            .map_err(|e| Error::invalid_response(e.to_string()))
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The causal consistency token the server attached, if any.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.raw_response.get_timestamp("operationTime").ok()
    }

    /// Which server replied.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        self.validate()?;
        let command_response: HelloCommandResponse = self.body()?;
        Ok(HelloReply {
            server_address: self.source,
            command_response,
            raw_command_response: self.raw_response,
            cluster_time: self.cluster_time,
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::doc;

    #[test]
    fn failed_reply_becomes_command_error() {
        let response = CommandResponse::with_document_and_address(
            ServerAddress::default(),
            doc! {
                "ok": 0,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "not primary",
                "errorLabels": ["RetryableWriteError"],
            },
        );
        assert!(!response.is_success());

        let error = response.validate().unwrap_err();
        assert_eq!(error.sdam_code(), Some(10107));
        assert!(error.is_notwritableprimary());
        assert!(error.contains_label("RetryableWriteError"));
    }

    #[test]
    fn cluster_time_is_extracted() {
        let response = CommandResponse::with_document_and_address(
            ServerAddress::default(),
            doc! {
                "ok": 1.0,
                "operationTime": Timestamp { time: 5, increment: 1 },
                "$clusterTime": {
                    "clusterTime": Timestamp { time: 5, increment: 2 },
                    "signature": {},
                },
            },
        );
        response.validate().unwrap();
        assert_eq!(
            response.operation_time(),
            Some(Timestamp {
                time: 5,
                increment: 1
            })
        );
        assert_eq!(
            response.cluster_time().map(|ct| ct.cluster_time),
            Some(Timestamp {
                time: 5,
                increment: 2
            })
        );
    }
}
