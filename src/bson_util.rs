use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
};

/// Reads a BSON number as an `i64`. Doubles count only when they hold a whole number.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(value: &Bson) -> Option<i64> {
    match *value {
        Bson::Int32(n) => Some(n.into()),
        Bson::Int64(n) => Some(n),
        Bson::Double(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Some(f as i64)
        }
        _ => None,
    }
}

/// Like [`get_int`], rejecting negative values.
pub(crate) fn get_u64(value: &Bson) -> Option<u64> {
    get_int(value).and_then(|n| u64::try_from(n).ok())
}

/// The command name of a command document.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Reads the little-endian length prefix of a BSON document.
pub(crate) fn document_length(bytes: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::invalid_response("document is shorter than its length prefix"))?;
    let length = i32::from_le_bytes(prefix);
    usize::try_from(length)
        .map_err(|_| Error::invalid_response(format!("invalid document length {}", length)))
}
