use std::any::Any;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC wall-clock time as whole unix seconds, truncated.
///
/// All visibility comparisons in the store are done in integer seconds;
/// sub-second precision is dropped here and never reappears.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// Best-effort extraction of a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked with a non-string payload".to_owned()
    }
}
