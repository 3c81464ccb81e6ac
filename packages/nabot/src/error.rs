//! Structured error types for nabot.
//!
//! Two layers, mirroring how the crate is used:
//!
//! - [`StorageError`] is returned by [`DataStorage`](crate::DataStorage) and
//!   [`StateStorage`](crate::StateStorage). `NotFound` is an expected,
//!   recoverable condition that callers branch on; the other variants are not.
//! - [`NabotError`] covers the framework itself: state registration mistakes
//!   and transition failures.
//!
//! Handler and render callbacks return `anyhow::Result` so application code can
//! use `?` on anything. Both error types here convert into `anyhow::Error`.

use thiserror::Error;

// =============================================================================
// Storage Error
// =============================================================================

/// Errors from per-conversation storage.
///
/// `NotFound` and `TypeMismatch` are deliberately distinct: the first means
/// "never set, removed, or cleared", the second means the caller asked for the
/// wrong type and is a bug in the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No value is stored under this key for this conversation.
    #[error("key not found")]
    NotFound,

    /// A value exists but cannot be read as the requested type.
    #[error("stored value for key {key:?} is not assignable to {expected}")]
    TypeMismatch {
        /// The data key that was read.
        key: String,
        /// Type name the caller asked for.
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("failed to encode value for key {key:?}")]
    Encode {
        /// The data key that was written.
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The storage backend failed (connection, timeout, poisoned lock, ...).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    /// Returns true for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

// =============================================================================
// Nabot Error
// =============================================================================

/// Framework errors raised by the state machine.
#[derive(Debug, Error)]
pub enum NabotError {
    /// A state with this name is already registered.
    #[error("a state with name {name:?} already exists")]
    DuplicateState {
        /// The conflicting state name.
        name: String,
    },

    /// `register_and_chain_states` was called with no states.
    #[error("at least one chainable state required")]
    EmptyStateChain,

    /// A transition targets a state the machine does not know.
    #[error("state {name:?} is not registered")]
    StateNotRegistered {
        /// The missing state name.
        name: String,
    },

    /// The state handler a transition belongs to has been dropped.
    #[error("state handler was dropped; transition is no longer usable")]
    StateMachineDropped,

    /// A state's next transition was invoked before anything set it.
    #[error("state {state:?} has no next transition")]
    NextTransitionUnset {
        /// Name of the state whose slot is empty.
        state: String,
    },

    /// Reading or writing the state stack failed.
    #[error("failed to access state stack: {0}")]
    Storage(#[from] StorageError),

    /// The state stack could not be serialized.
    #[error("failed to marshal stack: {0}")]
    EncodeStack(#[source] serde_json::Error),
}
