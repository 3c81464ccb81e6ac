//! Testing utilities: a minimal platform, a recording bot, and context helpers.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! nabot = { path = "../nabot", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use nabot::testing::{test_context, TestUpdate};
//!
//! let ctx = test_context(TestUpdate::message(42, "/start"));
//! to_main.go(&ctx).await?;
//! assert_eq!(ctx.bot().sent_texts(42), vec!["welcome"]);
//! ```

use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::core::{default_chat_info, Platform};
use crate::storage::{DataStorage, InMemoryDataStore};

/// Platform with a flat, hand-buildable update type.
#[derive(Debug, Clone, Copy)]
pub struct TestPlatform;

/// An update that is a message, a callback, both or neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestUpdate {
    pub chat: Option<i64>,
    pub user: Option<i64>,
    pub text: Option<String>,
    pub callback: Option<String>,
}

impl TestUpdate {
    /// A text message in `chat`.
    pub fn message(chat: i64, text: &str) -> Self {
        Self {
            chat: Some(chat),
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    /// A button callback in `chat`.
    pub fn callback(chat: i64, data: &str) -> Self {
        Self {
            chat: Some(chat),
            callback: Some(data.to_string()),
            ..Self::default()
        }
    }

    /// Attach a sender.
    pub fn from_user(mut self, user: i64) -> Self {
        self.user = Some(user);
        self
    }
}

impl Platform for TestPlatform {
    type Update = TestUpdate;
    type ChatId = i64;
    type Bot = RecordingBot;

    fn chat_id(update: &TestUpdate) -> Option<i64> {
        update.chat
    }

    fn user_id(update: &TestUpdate) -> Option<i64> {
        update.user
    }

    fn update_kind(update: &TestUpdate) -> &'static str {
        if update.callback.is_some() {
            "callback_query"
        } else if update.text.is_some() {
            "message"
        } else {
            "<unknown>"
        }
    }

    fn message_text(update: &TestUpdate) -> Option<&str> {
        update.text.as_deref()
    }

    fn callback_data(update: &TestUpdate) -> Option<&str> {
        update.callback.as_deref()
    }
}

/// Bot that records every message it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingBot {
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingBot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message.
    pub fn send(&self, chat: i64, text: impl Into<String>) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((chat, text.into()));
    }

    /// Every message sent so far, in order.
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Texts sent to one chat, in order.
    pub fn sent_texts(&self, chat: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, text)| text)
            .collect()
    }
}

/// Context over a fresh bot and a fresh in-memory store.
///
/// # Panics
///
/// Panics if the update has neither a chat nor a user.
pub fn test_context(update: TestUpdate) -> Context<TestPlatform> {
    test_context_with(Arc::new(RecordingBot::new()), Arc::new(InMemoryDataStore::new()), update)
}

/// Context sharing a bot and store with other contexts.
///
/// # Panics
///
/// Panics if the update has neither a chat nor a user.
pub fn test_context_with(
    bot: Arc<RecordingBot>,
    store: Arc<dyn DataStorage>,
    update: TestUpdate,
) -> Context<TestPlatform> {
    let chat = default_chat_info::<TestPlatform>(&update)
        .expect("test update must have a chat or a user");
    Context::new(bot, update, store, chat)
}
