//! Per-update context passed to handlers, states and transitions.
//!
//! # Immutability
//!
//! `Context` is immutable and cheap to clone: the update, bot handle, store
//! and routing facts sit behind one `Arc`, and only the span is per-clone.
//! Tagging the logger ([`Context::with_span`], [`Context::for_handler`])
//! returns a new value; the original is never touched, so a context can be
//! shared across tasks freely.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::core::{ChatInfo, Platform};
use crate::storage::{DataStorage, StorageContext};

struct Shared<P: Platform> {
    bot: Arc<P::Bot>,
    update: P::Update,
    store: Arc<dyn DataStorage>,
    chat_key: String,
    chat_id: P::ChatId,
    cancel: CancellationToken,
}

/// Everything a handler can see about the update it is processing.
///
/// The "logger" of a context is a [`tracing::Span`]. The dispatcher runs each
/// handler instrumented with the handler's span, so plain `tracing::info!`
/// calls inside a handler carry `chat`, `handler` and `state` fields.
pub struct Context<P: Platform> {
    shared: Arc<Shared<P>>,
    span: Span,
}

impl<P: Platform> Clone for Context<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            span: self.span.clone(),
        }
    }
}

impl<P: Platform> Context<P> {
    /// Create a context for one update.
    ///
    /// The dispatcher does this for every routed update. Build one yourself
    /// to run a transition outside of update handling (a scheduled reminder,
    /// say).
    pub fn new(
        bot: Arc<P::Bot>,
        update: P::Update,
        store: Arc<dyn DataStorage>,
        chat: ChatInfo<P::ChatId>,
    ) -> Self {
        let span = tracing::info_span!(
            "update",
            chat = %chat.chat_id,
            update_type = P::update_kind(&update),
        );
        Self {
            shared: Arc::new(Shared {
                bot,
                update,
                store,
                chat_key: chat.key,
                chat_id: chat.chat_id,
                cancel: CancellationToken::new(),
            }),
            span,
        }
    }

    /// Replace the cancellation token. Only meaningful before the context is
    /// cloned; later clones keep whatever token they were made with.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.cancel = cancel,
            None => {
                tracing::warn!("context already shared; cancellation token not replaced");
            }
        }
        self
    }

    /// Bot handle for replies.
    pub fn bot(&self) -> &P::Bot {
        &self.shared.bot
    }

    /// The raw update.
    pub fn update(&self) -> &P::Update {
        &self.shared.update
    }

    /// Reply address.
    pub fn chat_id(&self) -> &P::ChatId {
        &self.shared.chat_id
    }

    /// Conversation key scoping storage and the state stack.
    pub fn chat_key(&self) -> &str {
        &self.shared.chat_key
    }

    /// Shared data store.
    pub fn store(&self) -> &Arc<dyn DataStorage> {
        &self.shared.store
    }

    /// Cancellation token inherited from the app. Handlers that do long work
    /// should watch it; the dispatcher never cancels on its own.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Current logging span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// A copy of this context logging under `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            shared: self.shared.clone(),
            span,
        }
    }

    /// A copy of this context whose span is tagged with a handler name.
    pub fn for_handler(&self, name: &str) -> Self {
        self.with_span(tracing::info_span!(parent: &self.span, "handler", handler = %name))
    }

    /// A copy of this context whose span is tagged with a state name.
    pub fn for_state(&self, name: &str) -> Self {
        self.with_span(tracing::info_span!(parent: &self.span, "state", state = %name))
    }
}

impl<P: Platform> StorageContext for Context<P> {
    fn chat_key(&self) -> &str {
        Context::chat_key(self)
    }

    fn store(&self) -> &Arc<dyn DataStorage> {
        Context::store(self)
    }
}

impl<P: Platform> std::fmt::Debug for Context<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("chat_key", &self.shared.chat_key)
            .field("chat_id", &self.shared.chat_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, TestUpdate};

    #[test]
    fn test_tagging_does_not_mutate_original() {
        let ctx = test_context(TestUpdate::message(7, "hello"));
        let original_span = ctx.span().id();

        let tagged = ctx.for_handler("echo");

        assert_eq!(ctx.span().id(), original_span);
        assert_eq!(tagged.chat_key(), "7");
        assert_eq!(*tagged.chat_id(), 7);
    }

    #[test]
    fn test_cancellation_replaced_before_sharing() {
        let parent = CancellationToken::new();
        let ctx = test_context(TestUpdate::message(1, "x")).with_cancellation(parent.child_token());

        assert!(!ctx.cancellation().is_cancelled());
        parent.cancel();
        assert!(ctx.cancellation().is_cancelled());
    }
}
