//! Scoped consumption: lease a message, run a handler, settle the lease.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::error;

use crate::errors::{Error, Result};
use crate::queue::{ConsumeOptions, Queue};
use crate::schema::Message;
use crate::util::panic_message;

impl Queue {
    /// Pops a message and binds it to the outcome of `handler`.
    ///
    /// When the queue stays empty past the long-poll budget the handler is
    /// never invoked and `Ok(None)` is returned. Otherwise exactly one of
    /// ACK or NACK happens on every exit path:
    ///
    /// - handler resolves `Ok(value)` — the message is deleted and
    ///   `Ok(Some(value))` returned;
    /// - handler resolves `Err(_)` — the failure is recorded via
    ///   [`Queue::process_failed`] with the error's description as the
    ///   reason, then handed back as [`Error::Handler`];
    /// - handler panics — the panic is caught just long enough to NACK the
    ///   message with the panic message, then resumed.
    pub async fn consume<T, F, Fut>(
        &self,
        qname: &str,
        opts: &ConsumeOptions,
        handler: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(msg) = self.pop(qname, &opts.pop_options()).await? else {
            return Ok(None);
        };

        match AssertUnwindSafe(handler(msg.clone())).catch_unwind().await {
            Ok(Ok(value)) => {
                self.delete(msg.id).await?;
                Ok(Some(value))
            }
            Ok(Err(err)) => {
                if let Err(nack_err) = self.process_failed(&msg, &format!("{err:#}")).await {
                    error!(id = %msg.id, error = %nack_err, "failed to record handler failure");
                }
                Err(Error::Handler(err))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                if let Err(nack_err) = self.process_failed(&msg, &reason).await {
                    error!(id = %msg.id, error = %nack_err, "failed to record handler panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}
