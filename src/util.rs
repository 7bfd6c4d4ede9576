use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::value::RawValue;

use crate::error::CanonicalError;

static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Fresh `call_<hex>` id for tool calls a backend delivered without one.
#[inline]
pub(crate) fn next_call_id() -> String {
    let id = CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(21);
    out.push_str("call_");
    push_u64_hex_16(&mut out, id);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

pub(crate) fn raw_value_from_string(
    json: String,
    context: &'static str,
) -> Result<Box<RawValue>, CanonicalError> {
    RawValue::from_string(json).map_err(|e| {
        CanonicalError::Translation(format!(
            "Failed to convert {context} arguments to RawValue: {e}"
        ))
    })
}

/// Raw JSON for tool arguments; anything that does not parse becomes `{}`.
pub(crate) fn raw_arguments_or_empty(json: String, context: &'static str) -> Box<RawValue> {
    match RawValue::from_string(json) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::debug!(context, error = %err, "replacing unparseable tool arguments with {{}}");
            empty_object_raw()
        }
    }
}

pub(crate) fn empty_object_raw() -> Box<RawValue> {
    RawValue::from_string("{}".to_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_call_id_has_fixed_shape() {
        let id = next_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), 21);
        assert_ne!(id, next_call_id());
    }

    #[test]
    fn raw_arguments_fall_back_to_empty_object() {
        assert_eq!(raw_arguments_or_empty("{\"a\":1}".into(), "test").get(), "{\"a\":1}");
        assert_eq!(raw_arguments_or_empty("{\"a\":".into(), "test").get(), "{}");
    }
}
