//! Pluggable authentication performed while a connection is being established.

use std::fmt::Debug;

use futures_util::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::{bson::Document, error::Result, options::ServerAddress};

/// Who to authenticate as.
///
/// The crate ships no authentication mechanisms of its own. A credential is handed to the
/// [`AuthProvider`] configured on the client, which performs whatever conversation its
/// mechanism requires.
#[derive(Clone, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The database used to authenticate. Defaults to "admin".
    pub source: Option<String>,

    /// The password to authenticate with.
    pub password: Option<String>,

    /// The name of the mechanism the provider should use.
    pub mechanism: Option<String>,

    /// Mechanism-specific settings, passed through to the provider untouched.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }

    /// Appends the `saslSupportedMechs` negotiation field to a handshake command when the
    /// credential names a user but no mechanism.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

/// The command channel an [`AuthProvider`] talks to the server through. Implemented by
/// connections that are still being established.
pub trait AuthExchange: Send {
    /// The address of the server on the other end of the connection.
    fn address(&self) -> &ServerAddress;

    /// The raw reply to the handshake that opened this connection.
    fn hello_response(&self) -> &Document;

    /// Sends `command` against `db` and returns the server's reply. A reply with `ok: 0` is
    /// returned as an error.
    fn send_command<'a>(
        &'a mut self,
        db: &'a str,
        command: Document,
    ) -> BoxFuture<'a, Result<Document>>;
}

/// Performs authentication on a freshly established connection.
///
/// Providers are invoked after the handshake completes and before the connection is made
/// available to the pool. Returning an error closes the connection and fails the checkout that
/// triggered its creation.
pub trait AuthProvider: Send + Sync + Debug {
    /// Authenticate the connection behind `exchange` using `credential`.
    fn authenticate<'a>(
        &'a self,
        exchange: &'a mut dyn AuthExchange,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>>;
}
