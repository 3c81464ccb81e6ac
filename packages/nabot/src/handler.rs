//! Handler trait and the chain walk.
//!
//! Handlers are tried in registration order. A handler that does not want an
//! update returns [`Outcome::Declined`] and the update moves on; anything else
//! (success or error) ends the walk.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::core::Platform;

/// What a handler did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler processed the update; the chain stops.
    Handled,
    /// Not this handler's update; the chain continues.
    Declined,
}

/// Processes updates.
///
/// Return `Ok(Outcome::Declined)` to pass the update to the next handler.
/// Returning an error is terminal for the update: it is logged with the
/// handler's name and not retried.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Handler<Console> for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     async fn handle(&self, ctx: &Context<Console>) -> anyhow::Result<Outcome> {
///         let Some(text) = Console::message_text(ctx.update()) else {
///             return Ok(Outcome::Declined);
///         };
///         ctx.bot().send(ctx.chat_id(), text).await?;
///         Ok(Outcome::Handled)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<P: Platform>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process the update.
    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome>;
}

#[async_trait]
impl<P: Platform, H: Handler<P> + ?Sized> Handler<P> for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        (**self).handle(ctx).await
    }
}

/// Result of walking a handler chain.
#[derive(Debug)]
pub enum ChainOutcome {
    /// A handler accepted the update.
    Handled {
        /// Position of the handler in the chain.
        index: usize,
        /// The handler's name.
        handler: String,
    },
    /// A handler failed; later handlers were not tried.
    Failed {
        /// Position of the handler in the chain.
        index: usize,
        /// The handler's name.
        handler: String,
        /// What went wrong.
        error: anyhow::Error,
    },
    /// Every handler declined.
    Unhandled,
}

impl ChainOutcome {
    /// Index of the handler that ended the walk, if any.
    pub fn handler_index(&self) -> Option<usize> {
        match self {
            ChainOutcome::Handled { index, .. } | ChainOutcome::Failed { index, .. } => {
                Some(*index)
            }
            ChainOutcome::Unhandled => None,
        }
    }

    /// Collapse into a handler result: unhandled becomes a decline, so a
    /// nested chain declines when all of its members do.
    pub fn into_result(self) -> Result<Outcome> {
        match self {
            ChainOutcome::Handled { .. } => Ok(Outcome::Handled),
            ChainOutcome::Failed { error, .. } => Err(error),
            ChainOutcome::Unhandled => Ok(Outcome::Declined),
        }
    }
}

/// Walk `chain` in order until a handler does not decline.
///
/// Each handler sees a copy of `ctx` tagged with its own name; `ctx` itself is
/// left as it was.
pub async fn handle_chain<P: Platform>(
    chain: &[Arc<dyn Handler<P>>],
    ctx: &Context<P>,
) -> ChainOutcome {
    for (index, handler) in chain.iter().enumerate() {
        let handler_ctx = ctx.for_handler(handler.name());
        let span = handler_ctx.span().clone();

        match handler.handle(&handler_ctx).instrument(span).await {
            Ok(Outcome::Declined) => continue,
            Ok(Outcome::Handled) => {
                return ChainOutcome::Handled {
                    index,
                    handler: handler.name().to_string(),
                }
            }
            Err(error) => {
                return ChainOutcome::Failed {
                    index,
                    handler: handler.name().to_string(),
                    error,
                }
            }
        }
    }
    ChainOutcome::Unhandled
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
