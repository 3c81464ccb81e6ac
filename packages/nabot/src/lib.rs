//! # nabot
//!
//! A small framework for chat bots: an ordered chain of handlers, a
//! dispatcher that runs every update in its own task, and a stack of
//! conversation states that survives restarts if its storage does.
//!
//! Handlers are tried in registration order and the first one that does
//! not decline ends the walk. A [`StateHandler`] is just another handler in
//! that chain; it hands the update to the state on top of the
//! conversation's stack. A transport implements [`Platform`] and feeds
//! updates into [`App::run`].
//!
//! ```ignore
//! let states = StateHandler::new();
//! let to_menu = states.register_state(menu.into_state());
//!
//! let app = App::builder(bot)
//!     .handle(Command::new("start", move |ctx, _args| {
//!         let to_menu = to_menu.clone();
//!         async move { to_menu.go(&ctx).await }
//!     }))
//!     .handle(states.clone())
//!     .build();
//!
//! app.run(updates).await;
//! app.stop().await;
//! ```

mod context;
mod core;
mod engine;
mod error;
mod executor;
mod handler;
mod handlers;
mod state;
mod storage;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export platform types
pub use crate::core::{default_chat_info, ChatInfo, ChatInfoExtractor, Platform};

// Re-export context
pub use context::Context;

// Re-export handler types
pub use handler::{handle_chain, ChainOutcome, Handler, Outcome};
pub use handlers::{Command, Filter, Func, InlineButton, KeyboardButton, Text};

// Re-export storage types
pub use storage::{clear, DataKey, DataStorage, InMemoryDataStore, StorageContext};

// Re-export state types
pub use state::{
    BaseState, ChainableState, DataStorageStacks, InMemoryStateStore, NextTransition, State,
    StateHandler, StateStorage, Transition, TransitionKind, STATE_STACK_KEY,
};

// Re-export engine types (primary entry point)
pub use engine::{
    App, AppBuilder, AppConfig, InflightGuard, InflightTracker, Lifecycle, UpdateOutcome,
};

// Re-export executor types
pub use executor::{BoundedExecutor, Executor, SpawnExecutor, Task};

// Re-export error types
pub use error::{NabotError, StorageError};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
