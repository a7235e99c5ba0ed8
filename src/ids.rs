use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::timestamp::context::ContextV7;
use uuid::{Timestamp, Uuid};

/// Generates time-ordered (version 7) message identifiers.
///
/// The leading 48 bits carry the unix timestamp in milliseconds, so ids sort
/// by enqueue time and the dequeue index yields FIFO order. A shared
/// [`ContextV7`] keeps ids monotone within the process even when several are
/// drawn in the same millisecond; uniqueness beyond that rests on the random
/// tail, with the engine retrying inserts on the rare collision.
#[derive(Clone)]
pub(crate) struct IdGenerator {
    context: Arc<Mutex<ContextV7>>,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            context: Arc::new(Mutex::new(ContextV7::new())),
        }
    }

    pub(crate) fn generate(&self) -> Uuid {
        let context = self.context.lock().unwrap_or_else(|err| err.into_inner());
        Uuid::new_v7(Timestamp::now(&*context))
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
