use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;

use crate::{
    bson::{doc, Document},
    client::auth::{AuthExchange, AuthProvider, Credential},
    cmap::{Command, Connection, StreamDescription},
    error::{Error, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::ServerAddress,
};

/// The part of the `client` handshake document that does not depend on the options.
static BASE_CLIENT_METADATA: LazyLock<Document> = LazyLock::new(|| {
    doc! {
        "driver": {
            "name": "mongodb-driver-core",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": format!("rustc {}", rustc_version_runtime::version()),
    }
});

#[derive(Clone, Debug, Default)]
pub(crate) struct HandshakerOptions {
    /// Sent as `client.application.name`, which shows up in server logs.
    pub(crate) app_name: Option<String>,

    /// The provider used to authenticate pooled connections.
    pub(crate) auth_provider: Option<Arc<dyn AuthProvider>>,
}

/// Runs the hello handshake and then, for pool connections, the auth provider.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The `client` document sent with every handshake.
    metadata: Document,

    auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        if let Some(app_name) = options.app_name {
            metadata.insert("application", doc! { "name": app_name });
        }

        Self {
            metadata,
            auth_provider: options.auth_provider,
        }
    }

    fn command(&self, credential: Option<&Credential>) -> Command {
        let mut command = hello_command(None, Some(&self.metadata));
        if let Some(credential) = credential {
            credential.append_needed_mechanism_negotiation(&mut command.body);
        }
        command
    }

    /// Runs the initial hello on a freshly opened connection and records what it learned about
    /// the server on the connection.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let reply = run_hello(conn, self.command(credential)).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        conn.server_id = reply.command_response.connection_id;

        Ok(reply)
    }

    /// Hands a handshaked connection to the configured [`AuthProvider`].
    pub(crate) async fn authenticate(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        hello_reply: &HelloReply,
    ) -> Result<()> {
        let provider = self.auth_provider.as_ref().ok_or_else(|| {
            Error::authentication_error(
                "a credential was supplied but no authentication provider is configured",
            )
        })?;

        let mut exchange = ConnectionAuthExchange {
            connection: conn,
            hello_response: &hello_reply.raw_command_response,
        };
        provider.authenticate(&mut exchange, credential).await
    }
}

/// Exposes a connection that is still being established to an [`AuthProvider`].
struct ConnectionAuthExchange<'a> {
    connection: &'a mut Connection,
    hello_response: &'a Document,
}

impl AuthExchange for ConnectionAuthExchange<'_> {
    fn address(&self) -> &ServerAddress {
        self.connection.address()
    }

    fn hello_response(&self) -> &Document {
        self.hello_response
    }

    fn send_command<'a>(
        &'a mut self,
        db: &'a str,
        command: Document,
    ) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move {
            let name = command.keys().next().cloned().unwrap_or_default();
            let response = self
                .connection
                .send_command(Command::new(name, db, command))
                .await?;
            response.validate()?;
            Ok(response.raw_response)
        })
    }
}
