#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod consume;
mod errors;
mod ids;
mod queue;
mod schema;
mod store;
mod storage;
mod util;

/// Error kinds surfaced by queue operations.
pub use self::errors::{Error, Result};
/// The queue engine and its configuration surface.
pub use self::queue::{ConsumeOptions, MAX_BATCH, PopOptions, PutOptions, Queue, QueueBuilder};
/// Message handle and the default queue name.
pub use self::schema::{DEFAULT_QUEUE, Message};
