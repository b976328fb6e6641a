pub(crate) mod handshake;
#[cfg(test)]
mod test;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use self::handshake::{Handshaker, HandshakerOptions};
use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    Connection,
};
use crate::{
    client::auth::Credential,
    error::{Error, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    runtime::{AsyncStream, StreamConnector, TcpConnector},
    sdam::HandshakePhase,
};

/// Turns an address into a usable connection: open a stream, run the hello handshake and, for
/// pool connections, authenticate.
///
/// Shared by every pool and monitor of a topology.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,
    connector: Arc<dyn StreamConnector>,
    connect_timeout: Option<Duration>,
    credential: Option<Credential>,
}

/// The parts of the client options a [`ConnectionEstablisher`] needs.
pub(crate) struct EstablisherOptions {
    handshake: HandshakerOptions,
    connector: Option<Arc<dyn StreamConnector>>,
    connect_timeout: Option<Duration>,
    credential: Option<Credential>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            handshake: HandshakerOptions {
                app_name: options.app_name.clone(),
                auth_provider: options.auth_provider.clone(),
            },
            connector: options.stream_connector.clone(),
            connect_timeout: options.connect_timeout,
            credential: options.credential.clone(),
        }
    }
}

impl ConnectionEstablisher {
    /// Without a custom [`StreamConnector`], plain TCP is used.
    pub(crate) fn new(options: EstablisherOptions) -> Self {
        let EstablisherOptions {
            handshake,
            connector,
            connect_timeout,
            credential,
        } = options;
        Self {
            handshaker: Handshaker::new(handshake),
            connector: connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            connect_timeout,
            credential,
        }
    }

    async fn open(&self, address: &ServerAddress) -> Result<AsyncStream> {
        self.connector.connect(address, self.connect_timeout).await
    }

    /// Opens, handshakes and authenticates a connection for a pool. On failure the error
    /// records how far the handshake got, which decides what the topology does about it.
    pub(crate) async fn establish_connection(
        &self,
        pending: PendingConnection,
    ) -> std::result::Result<PooledConnection, EstablishError> {
        let generation = pending.generation;
        let before_hello = |cause| EstablishError {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        };

        let stream = self
            .open(&pending.address)
            .await
            .map_err(before_hello)?;
        let mut connection = PooledConnection::new(pending, stream);
        let reply = self
            .handshaker
            .handshake(&mut connection, self.credential.as_ref())
            .await
            .map_err(before_hello)?;

        if let Some(credential) = &self.credential {
            self.handshaker
                .authenticate(&mut connection, credential, &reply)
                .await
                .map_err(|cause| EstablishError {
                    cause,
                    handshake_phase: HandshakePhase::PostHello { generation },
                })?;
        }
        Ok(connection)
    }

    /// Opens a connection for a monitor. Monitors never authenticate, and the hello reply is
    /// handed back as the first check's result.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.open(&address).await?;
        let mut connection = Connection::new(address, stream, id, Instant::now());
        let reply = self.handshaker.handshake(&mut connection, None).await?;
        Ok((connection, reply))
    }
}

/// A failed attempt to establish a pool connection.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}
