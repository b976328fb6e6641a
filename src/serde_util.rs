//! Serde adapters for the integer encodings the server expects.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Writes an int32 when the value fits and an int64 otherwise, which is what the server does
/// with its own counters.
fn serialize_smallest_int<S: Serializer>(
    value: u128,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    if let Ok(small) = i32::try_from(value) {
        serializer.serialize_i32(small)
    } else {
        serializer.serialize_i64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// `Option<Duration>` as whole seconds, e.g. `maxStalenessSeconds`.
pub(crate) mod duration_option_as_int_seconds {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serialize_smallest_int(duration.as_secs().into(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// `Option<Duration>` as whole milliseconds, e.g. `maxTimeMS`.
pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serialize_smallest_int(duration.as_millis(), serializer),
        None => serializer.serialize_none(),
    }
}

/// Batch sizes and similar counts, which the server reads as int32.
#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_u32_option_as_i32<S: Serializer>(
    value: &Option<u32>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value.map(i32::try_from) {
        Some(Ok(n)) => serializer.serialize_i32(n),
        Some(Err(_)) => Err(serde::ser::Error::custom(format!(
            "{} does not fit in a signed 32-bit integer",
            value.unwrap_or_default()
        ))),
        None => serializer.serialize_none(),
    }
}
