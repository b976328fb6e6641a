//! Mirrors driver events into `tracing`, one target per component.
//!
//! Every record carries the topology id and, where one applies, the server as `host:port`.
//! Documents are rendered as relaxed extended JSON and cut off after
//! [`MAX_DOCUMENT_LENGTH`] bytes.

pub(crate) mod command;
pub(crate) mod connection;
pub(crate) mod cursor;
pub(crate) mod server_selection;
pub(crate) mod topology;

use crate::{
    bson::{Bson, Document},
    error::{Error, ErrorKind},
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_driver_core::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_driver_core::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str =
    "mongodb_driver_core::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_driver_core::topology";
pub(crate) const CURSOR_TRACING_EVENT_TARGET: &str = "mongodb_driver_core::cursor";

pub(crate) const MAX_DOCUMENT_LENGTH: usize = 1000;

/// Renders `doc` for a log line.
pub(crate) fn json(doc: &Document) -> String {
    let mut rendered = Bson::Document(doc.clone())
        .into_relaxed_extjson()
        .to_string();
    truncate(&mut rendered, MAX_DOCUMENT_LENGTH);
    rendered
}

/// Renders `error` for a log line, including its labels and the chain of sources. Server
/// messages are truncated like documents are.
pub(crate) fn failure(error: &Error) -> String {
    let mut out = String::new();
    let mut next = Some(error);
    while let Some(error) = next {
        if !out.is_empty() {
            out.push_str(", caused by: ");
        }
        match *error.kind {
            ErrorKind::Command(ref command_error) => {
                let mut message = command_error.message.clone();
                truncate(&mut message, MAX_DOCUMENT_LENGTH);
                out.push_str(&format!(
                    "command error {} ({}): {}",
                    command_error.code, command_error.code_name, message
                ));
            }
            ref kind => out.push_str(&kind.to_string()),
        }
        if !error.labels().is_empty() {
            let mut labels: Vec<_> = error.labels().iter().map(String::as_str).collect();
            labels.sort_unstable();
            out.push_str(&format!(" [{}]", labels.join(", ")));
        }
        next = error.source.as_deref();
    }
    out
}

/// Cuts `s` down to at least `max_len` bytes, extending to the next character boundary, and
/// marks the cut with "...".
pub(crate) fn truncate(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let cut = (max_len..=s.len())
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(s.len());
    if cut < s.len() {
        s.truncate(cut);
        s.push_str("...");
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::doc;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "héllo".to_string();
        truncate(&mut s, 2);
        assert_eq!(s, "hé...");

        let mut s = "short".to_string();
        truncate(&mut s, 10);
        assert_eq!(s, "short");
    }

    #[test]
    fn documents_are_logged_as_relaxed_json() {
        assert_eq!(json(&doc! { "ping": 1 }), r#"{"ping":1}"#);

        let long = json(&doc! { "x": "a".repeat(2 * MAX_DOCUMENT_LENGTH) });
        assert_eq!(long.len(), MAX_DOCUMENT_LENGTH + 3);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn failures_include_sources_and_labels() {
        let mut cause = Error::network("reset by peer");
        cause.add_label("RetryableWriteError");
        let error = Error::internal("retry failed").with_source(cause);

        let rendered = failure(&error);
        assert!(rendered.contains("retry failed"), "{}", rendered);
        assert!(rendered.contains("caused by"), "{}", rendered);
        assert!(rendered.ends_with("[RetryableWriteError]"), "{}", rendered);
    }
}
