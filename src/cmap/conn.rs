mod command;
pub(crate) mod pooled;
mod stream_description;
pub(crate) mod wire;

use std::time::Instant;

use derive_where::derive_where;
use tokio::io::{AsyncWriteExt, BufStream};

use self::wire::{next_request_id, Message};
use crate::{
    error::{Error, Result},
    event::cmap::{CmapEventEmitter, ConnectionCreatedEvent},
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, CommandResponse};
pub(crate) use stream_description::StreamDescription;

/// A wrapper around a byte stream that exchanges commands with a single server.
#[derive_where(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    /// Server-generated ID for the connection, learned from the handshake.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    pub(crate) time_created: Instant,

    /// Filled in from the hello reply once the handshake completes.
    pub(super) stream_description: Option<StreamDescription>,

    /// Set while a round trip is in progress. A connection dropped with this set was abandoned
    /// mid-command and cannot be reused.
    command_executing: bool,

    /// Stores a network error encountered while reading or writing. Once set, the connection is
    /// never handed out again.
    error: Option<Error>,

    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            time_created,
            stream_description: None,
            command_executing: false,
            error: None,
            stream: BufStream::new(stream),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Runs one round trip. `Ok` only means a reply came back; whether the command succeeded
    /// is up to the caller to check.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<CommandResponse> {
        self.send_command_with_id(command, next_request_id()).await
    }

    pub(crate) async fn send_command_with_id(
        &mut self,
        command: Command,
        request_id: i32,
    ) -> Result<CommandResponse> {
        let message = Message::from_command(command, Some(request_id))?;
        let response = self.send_message(message).await?;
        CommandResponse::new(self.address.clone(), response)
    }

    async fn send_message(&mut self, message: Message) -> Result<Message> {
        if let Some(ref error) = self.error {
            return Err(Error::internal(format!(
                "Attempted to send a message on errored connection {}: {}",
                self.id, error
            )));
        }

        self.command_executing = true;

        let write_result = async {
            message.write_to(&mut self.stream).await?;
            self.stream.flush().await?;
            Ok::<(), Error>(())
        }
        .await;

        let response_message_result = match write_result {
            Ok(()) => {
                let max_message_size = self
                    .stream_description
                    .as_ref()
                    .map(|sd| sd.max_message_size_bytes);
                Message::read_from(&mut self.stream, max_message_size).await
            }
            Err(error) => Err(error),
        };

        self.command_executing = false;
        if let Err(ref error) = response_message_result {
            self.error = Some(error.clone());
        }

        response_message_result
    }

    /// What the handshake learned about the server. Errors before the handshake completes.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    /// Marks the connection unusable. Used when an in-flight exchange was abandoned, since the
    /// server may still send the reply to it.
    pub(crate) fn mark_as_errored(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Whether an error has been encountered on this connection.
    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the connection is in the middle of an exchange.
    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

/// A connection that has been created but not yet established: its stream has not been opened
/// and it has not been handshaked.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    /// Helper to create a `ConnectionCreatedEvent` for the connection.
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}
