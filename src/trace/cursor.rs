use super::{failure, CURSOR_TRACING_EVENT_TARGET};
use crate::{error::Error, operation::Namespace, options::ServerAddress};

pub(crate) fn batch_fetched(ns: &Namespace, cursor_id: i64, returned: usize, exhausted: bool) {
    tracing::debug!(
        target: CURSOR_TRACING_EVENT_TARGET,
        namespace = %ns,
        cursor_id,
        returned,
        exhausted,
        "Cursor batch fetched"
    );
}

pub(crate) fn revived(ns: &Namespace, cursor_id: i64) {
    tracing::debug!(
        target: CURSOR_TRACING_EVENT_TARGET,
        namespace = %ns,
        cursor_id,
        "Tailable cursor revived"
    );
}

pub(crate) fn killed(ns: &Namespace, cursor_id: i64, server: &ServerAddress) {
    tracing::debug!(
        target: CURSOR_TRACING_EVENT_TARGET,
        namespace = %ns,
        cursor_id,
        server = %server,
        "Cursor killed"
    );
}

/// killCursors is advisory, so its failures are logged and otherwise ignored.
pub(crate) fn kill_failed(ns: &Namespace, cursor_id: i64, error: &Error) {
    tracing::warn!(
        target: CURSOR_TRACING_EVENT_TARGET,
        namespace = %ns,
        cursor_id,
        failure = failure(error),
        "Failed to kill cursor"
    );
}
