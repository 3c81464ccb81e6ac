//! Core platform abstraction.
//!
//! nabot never looks inside a chat platform's update schema. A [`Platform`]
//! names the three opaque types a transport deals in and exposes the handful
//! of facts the framework needs from an update: which chat it belongs to, and
//! (for the bundled handlers) its text or callback payload.

use std::fmt;
use std::sync::Arc;

/// The opaque types of a chat platform.
///
/// Implement this on a marker type for each transport.
///
/// # Example
///
/// ```ignore
/// struct Console;
///
/// impl Platform for Console {
///     type Update = ConsoleUpdate;
///     type ChatId = i64;
///     type Bot = ConsoleBot;
///
///     fn chat_id(update: &ConsoleUpdate) -> Option<i64> {
///         update.chat_id
///     }
/// }
/// ```
pub trait Platform: Send + Sync + 'static {
    /// One inbound unit from the transport.
    type Update: Send + Sync + 'static;

    /// Destination address usable for replies.
    type ChatId: Clone + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Client handle used to talk back to the platform.
    type Bot: Send + Sync + 'static;

    /// The chat an update was sent in, if it has one.
    fn chat_id(update: &Self::Update) -> Option<Self::ChatId>;

    /// The user an update came from, for updates that are not bound to a chat.
    fn user_id(_update: &Self::Update) -> Option<Self::ChatId> {
        None
    }

    /// Short label for the kind of update, used in logs.
    fn update_kind(_update: &Self::Update) -> &'static str {
        "<unknown>"
    }

    /// Text of a plain message update.
    fn message_text(_update: &Self::Update) -> Option<&str> {
        None
    }

    /// Payload of a button callback update.
    fn callback_data(_update: &Self::Update) -> Option<&str> {
        None
    }
}

/// Routing facts derived from an update before any handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo<C> {
    /// Stable key scoping the conversation's data and state stack.
    pub key: String,
    /// Where replies go.
    pub chat_id: C,
}

impl<C: fmt::Display> ChatInfo<C> {
    /// Build chat info keyed by the identifier's string form.
    pub fn from_id(chat_id: C) -> Self {
        Self {
            key: chat_id.to_string(),
            chat_id,
        }
    }
}

/// Pluggable routing policy: `None` means the update has no conversation and
/// is dropped before dispatch.
pub type ChatInfoExtractor<P> =
    Arc<dyn Fn(&<P as Platform>::Update) -> Option<ChatInfo<<P as Platform>::ChatId>> + Send + Sync>;

/// Default routing policy.
///
/// Uses the chat identifier when the update has one, otherwise the user
/// identifier (inline queries, poll answers and the like).
pub fn default_chat_info<P: Platform>(update: &P::Update) -> Option<ChatInfo<P::ChatId>> {
    P::chat_id(update)
        .or_else(|| P::user_id(update))
        .map(ChatInfo::from_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPlatform, TestUpdate};

    #[test]
    fn test_default_prefers_chat_over_user() {
        let update = TestUpdate::message(10, "hi").from_user(99);
        let info = default_chat_info::<TestPlatform>(&update).unwrap();
        assert_eq!(info.key, "10");
        assert_eq!(info.chat_id, 10);
    }

    #[test]
    fn test_default_falls_back_to_user() {
        let update = TestUpdate::default().from_user(99);
        let info = default_chat_info::<TestPlatform>(&update).unwrap();
        assert_eq!(info.key, "99");
    }

    #[test]
    fn test_default_rejects_unroutable_update() {
        let update = TestUpdate::default();
        assert!(default_chat_info::<TestPlatform>(&update).is_none());
    }
}
