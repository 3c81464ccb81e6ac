//! Per-conversation key/value storage.
//!
//! # The Contract
//!
//! 1. **Scoped by conversation.** Every entry lives under a
//!    `(chat_key, data_key)` pair. Nothing is visible across conversations.
//!
//! 2. **NotFound is distinct.** Reading a key that was never set, was removed,
//!    or was cleared returns [`StorageError::NotFound`]. Reading a key as the
//!    wrong type returns [`StorageError::TypeMismatch`].
//!
//! 3. **Clear is atomic.** After `clear_data` returns, no key of that
//!    conversation is readable; no partially-cleared state is observable.
//!
//! 4. **Per-key serializable.** Concurrent operations on the same conversation
//!    behave as if run one after another. Last write wins.
//!
//! Values are stored as `serde_json::Value`, which lets a database-backed
//! implementation persist them as-is. [`DataKey`] adds the typed layer.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Stores arbitrary data for each conversation.
///
/// An in-memory implementation is available as [`InMemoryDataStore`].
/// Implement this trait to back conversations with a database or cache.
#[async_trait]
pub trait DataStorage: Send + Sync + 'static {
    /// Store `value` under `data_key`, replacing any previous value.
    async fn set_data(&self, chat_key: &str, data_key: &str, value: Value)
        -> Result<(), StorageError>;

    /// Load the value under `data_key`, or [`StorageError::NotFound`].
    async fn get_data(&self, chat_key: &str, data_key: &str) -> Result<Value, StorageError>;

    /// Remove one key. Removing a missing key is not an error.
    async fn remove_data(&self, chat_key: &str, data_key: &str) -> Result<(), StorageError>;

    /// Remove every key of a conversation.
    async fn clear_data(&self, chat_key: &str) -> Result<(), StorageError>;
}

/// What typed storage access needs from a context.
pub trait StorageContext {
    /// Conversation key the data is scoped to.
    fn chat_key(&self) -> &str;

    /// Store handle.
    fn store(&self) -> &Arc<dyn DataStorage>;
}

// =============================================================================
// DataKey
// =============================================================================

/// A typed key into a conversation's data.
///
/// # Example
///
/// ```ignore
/// const FIRST_NAME: DataKey<String> = DataKey::new("first_name");
///
/// FIRST_NAME.set(&ctx, "John".to_string()).await?;
/// let name = FIRST_NAME.get(&ctx).await?;
/// ```
pub struct DataKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataKey<T> {
    /// Declare a key.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The raw key name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for DataKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DataKey<T> {}

impl<T> std::fmt::Debug for DataKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataKey").field(&self.name).finish()
    }
}

impl<T: Serialize + DeserializeOwned> DataKey<T> {
    /// Store a value for the context's conversation.
    pub async fn set<C: StorageContext + ?Sized>(&self, ctx: &C, value: T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            key: self.name.to_string(),
            source,
        })?;
        ctx.store().set_data(ctx.chat_key(), self.name, value).await
    }

    /// Load the value for the context's conversation.
    ///
    /// Returns [`StorageError::NotFound`] if nothing is stored, or
    /// [`StorageError::TypeMismatch`] if the stored value is not a `T`.
    pub async fn get<C: StorageContext + ?Sized>(&self, ctx: &C) -> Result<T, StorageError> {
        let value = ctx.store().get_data(ctx.chat_key(), self.name).await?;
        serde_json::from_value(value).map_err(|source| StorageError::TypeMismatch {
            key: self.name.to_string(),
            expected: std::any::type_name::<T>(),
            source,
        })
    }

    /// Delete the value for the context's conversation.
    pub async fn remove<C: StorageContext + ?Sized>(&self, ctx: &C) -> Result<(), StorageError> {
        ctx.store().remove_data(ctx.chat_key(), self.name).await
    }
}

/// Remove all data of the context's conversation.
pub async fn clear<C: StorageContext + ?Sized>(ctx: &C) -> Result<(), StorageError> {
    ctx.store().clear_data(ctx.chat_key()).await
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory data store.
///
/// Each conversation's map sits behind one shard lock of a `DashMap`, which
/// gives the per-conversation serializability the contract asks for. Data is
/// lost when the process exits.
#[derive(Default)]
pub struct InMemoryDataStore {
    data: DashMap<String, HashMap<String, Value>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations with at least one stored key.
    pub fn conversation_count(&self) -> usize {
        self.data.len()
    }
}

#[async_trait]
impl DataStorage for InMemoryDataStore {
    async fn set_data(
        &self,
        chat_key: &str,
        data_key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        self.data
            .entry(chat_key.to_string())
            .or_default()
            .insert(data_key.to_string(), value);
        Ok(())
    }

    async fn get_data(&self, chat_key: &str, data_key: &str) -> Result<Value, StorageError> {
        self.data
            .get(chat_key)
            .and_then(|data| data.get(data_key).cloned())
            .ok_or(StorageError::NotFound)
    }

    async fn remove_data(&self, chat_key: &str, data_key: &str) -> Result<(), StorageError> {
        if let Some(mut data) = self.data.get_mut(chat_key) {
            data.remove(data_key);
        }
        Ok(())
    }

    async fn clear_data(&self, chat_key: &str) -> Result<(), StorageError> {
        self.data.remove(chat_key);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDataStore")
            .field("conversations", &self.data.len())
            .finish()
    }
}
