use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use futures_util::future::BoxFuture;
use pretty_assertions::assert_eq;

use super::{ConnectionEstablisher, EstablisherOptions};
use crate::{
    bson::{doc, oid::ObjectId, Document},
    client::auth::{AuthExchange, AuthProvider, Credential},
    cmap::{conn::PendingConnection, Command},
    error::{Error, Result},
    event::cmap::CmapEventEmitter,
    options::ClientOptions,
    sdam::ServerType,
    test::MockDeployment,
};

/// Records what it saw and runs one command over the connection being established.
#[derive(Debug, Default)]
struct RecordingProvider {
    seen: Mutex<Vec<(String, Option<String>, bool)>>,
    fail: bool,
}

impl AuthProvider for RecordingProvider {
    fn authenticate<'a>(
        &'a self,
        exchange: &'a mut dyn AuthExchange,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let is_primary = exchange
                .hello_response()
                .get_bool("isWritablePrimary")
                .unwrap_or(false);
            self.seen.lock().unwrap().push((
                exchange.address().to_string(),
                credential.username.clone(),
                is_primary,
            ));

            let db = credential.source.clone().unwrap_or_else(|| "admin".into());
            exchange.send_command(&db, doc! { "ping": 1 }).await?;

            if self.fail {
                return Err(Error::authentication_error("bad credentials"));
            }
            Ok(())
        })
    }
}

fn pending(deployment: &MockDeployment) -> PendingConnection {
    PendingConnection {
        id: 1,
        address: deployment.addresses()[0].clone(),
        generation: 0,
        event_emitter: CmapEventEmitter::new(None, ObjectId::new()),
        time_created: Instant::now(),
    }
}

fn establisher(options: &ClientOptions) -> ConnectionEstablisher {
    ConnectionEstablisher::new(EstablisherOptions::from_client_options(options))
}

#[tokio::test]
async fn handshake_sends_client_metadata() {
    let deployment = MockDeployment::standalone();
    let mut options = deployment.client_options();
    options.app_name = Some("reporting".to_string());

    let mut connection = establisher(&options)
        .establish_connection(pending(&deployment))
        .await
        .unwrap();

    let handshakes = deployment.handshakes();
    assert_eq!(handshakes.len(), 1);
    let body = &handshakes[0].body;
    assert_eq!(handshakes[0].name, "ismaster");
    assert_eq!(body.get_bool("helloOk").unwrap(), true);

    let client = body.get_document("client").unwrap();
    assert_eq!(
        client.get_document("application").unwrap(),
        &doc! { "name": "reporting" }
    );
    assert_eq!(
        client
            .get_document("driver")
            .unwrap()
            .get_str("name")
            .unwrap(),
        "mongodb-driver-core"
    );
    assert!(client.get_document("os").unwrap().contains_key("type"));

    let description = connection.stream_description().unwrap();
    assert_eq!(description.initial_server_type, ServerType::Standalone);
    assert_eq!(description.max_wire_version, Some(17));
    assert!(connection.server_id.is_some());

    let reply = connection
        .send_command(Command::new("ping", "admin", doc! { "ping": 1 }))
        .await
        .unwrap();
    reply.validate().unwrap();
}

#[tokio::test]
async fn credential_is_handed_to_the_auth_provider() {
    let deployment = MockDeployment::standalone();
    let provider = Arc::new(RecordingProvider::default());
    let mut options = deployment.client_options();
    options.credential = Some(
        Credential::builder()
            .username("alice".to_string())
            .source("reporting".to_string())
            .build(),
    );
    options.auth_provider = Some(provider.clone());

    establisher(&options)
        .establish_connection(pending(&deployment))
        .await
        .unwrap();

    assert_eq!(
        *provider.seen.lock().unwrap(),
        vec![(
            "standalone:27017".to_string(),
            Some("alice".to_string()),
            true
        )]
    );

    // a user without a mechanism asks the server which mechanisms it supports.
    let handshake = deployment.handshakes().pop().unwrap();
    assert_eq!(
        handshake.body.get_str("saslSupportedMechs").unwrap(),
        "reporting.alice"
    );

    let pings = deployment.commands_named("ping");
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].body.get_str("$db").unwrap(), "reporting");
}

#[tokio::test]
async fn auth_failure_fails_establishment() {
    let deployment = MockDeployment::standalone();
    let provider = Arc::new(RecordingProvider {
        fail: true,
        ..Default::default()
    });
    let mut options = deployment.client_options();
    options.credential = Some(Credential::builder().username("alice".to_string()).build());
    options.auth_provider = Some(provider);

    let error = establisher(&options)
        .establish_connection(pending(&deployment))
        .await
        .unwrap_err();
    assert!(error.cause.is_auth_error(), "{:?}", error.cause);
    assert!(matches!(
        error.handshake_phase,
        crate::sdam::HandshakePhase::PostHello { generation: 0 }
    ));
}

#[tokio::test]
async fn credential_without_provider_is_rejected() {
    let deployment = MockDeployment::standalone();
    let mut options = deployment.client_options();
    options.credential = Some(Credential::builder().username("alice".to_string()).build());

    let error = establisher(&options)
        .establish_connection(pending(&deployment))
        .await
        .unwrap_err();
    assert!(error.cause.is_auth_error());
}

#[tokio::test]
async fn refused_connection_fails_before_hello() {
    let deployment = MockDeployment::standalone();
    let address = deployment.addresses()[0].clone();
    deployment.set_host_down(&address, true);

    let error = establisher(&deployment.client_options())
        .establish_connection(pending(&deployment))
        .await
        .unwrap_err();
    assert!(error.cause.is_network_error());
    assert!(matches!(
        error.handshake_phase,
        crate::sdam::HandshakePhase::PreHello { generation: 0 }
    ));
    assert!(deployment.handshakes().is_empty());
}

#[tokio::test]
async fn monitoring_connections_skip_authentication() {
    let deployment = MockDeployment::standalone();
    let provider = Arc::new(RecordingProvider::default());
    let mut options = deployment.client_options();
    options.credential = Some(Credential::builder().username("alice".to_string()).build());
    options.auth_provider = Some(provider.clone());

    let (_connection, reply) = establisher(&options)
        .establish_monitoring_connection(deployment.addresses()[0].clone(), 7)
        .await
        .unwrap();

    assert!(reply.command_response.is_writable_primary.unwrap_or(false));
    assert!(provider.seen.lock().unwrap().is_empty());
    let handshake: Document = deployment.handshakes().pop().unwrap().body;
    assert!(!handshake.contains_key("saslSupportedMechs"));
}
