//! Stack-based conversation states.
//!
//! A [`StateHandler`] keeps, for every conversation, a stack of state names.
//! The state on top handles the conversation's updates. [`Transition`]s move
//! between states:
//!
//! - **To a state.** If the target is already on the stack, everything above
//!   it is dropped; otherwise it is pushed. Navigating back and forth between
//!   two states therefore never grows the stack.
//! - **Back.** Pops the top. With nothing left, the conversation has no
//!   active state and the handler declines its updates.
//!
//! After a transition persists the new stack, the state that ended up on top
//! is rendered. The stack write is not rolled back if rendering fails: the
//! state change is durable before the UI refresh is attempted.
//!
//! # Persistence
//!
//! Stacks are stored as a JSON array of names through [`StateStorage`].
//!
//! - A stack that cannot be parsed is logged and treated as empty.
//! - Names that are not registered are dropped on read and never written.
//!
//! # Concurrency
//!
//! A transition is read-stack, modify, write-stack: three separate storage
//! calls. Two updates for the same conversation running at once can
//! interleave those steps and the last write wins. Serialize per conversation
//! (executor or storage) if that matters to you.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn, Instrument};

use crate::context::Context;
use crate::core::Platform;
use crate::error::{NabotError, StorageError};
use crate::handler::{handle_chain, Handler, Outcome};
use crate::storage::DataStorage;

/// Key under which [`DataStorageStacks`] keeps a conversation's stack.
pub const STATE_STACK_KEY: &str = "nabot.state_stack";

// =============================================================================
// State Storage
// =============================================================================

/// Stores and retrieves serialized state stacks.
#[async_trait]
pub trait StateStorage: Send + Sync + 'static {
    /// The stored blob, or `None` if this conversation never had a stack.
    async fn get_stack(&self, chat_key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored blob.
    async fn set_stack(&self, chat_key: &str, stack: Vec<u8>) -> Result<(), StorageError>;
}

/// In-memory state storage. The default for [`StateHandler::new`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    data: DashMap<String, Vec<u8>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for InMemoryStateStore {
    async fn get_stack(&self, chat_key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(chat_key).map(|blob| blob.clone()))
    }

    async fn set_stack(&self, chat_key: &str, stack: Vec<u8>) -> Result<(), StorageError> {
        self.data.insert(chat_key.to_string(), stack);
        Ok(())
    }
}

/// Keeps stacks inside a [`DataStorage`] under [`STATE_STACK_KEY`].
///
/// Use this to make stacks as durable as the rest of the conversation's
/// data. Note that clearing the conversation's data clears its stack too.
pub struct DataStorageStacks {
    store: Arc<dyn DataStorage>,
}

impl DataStorageStacks {
    pub fn new(store: Arc<dyn DataStorage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateStorage for DataStorageStacks {
    async fn get_stack(&self, chat_key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.store.get_data(chat_key, STATE_STACK_KEY).await {
            Ok(Value::String(blob)) => Ok(Some(blob.into_bytes())),
            // Hand anything else to the parser; it soft-fails if it must.
            Ok(other) => Ok(Some(other.to_string().into_bytes())),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_stack(&self, chat_key: &str, stack: Vec<u8>) -> Result<(), StorageError> {
        let blob = String::from_utf8(stack)
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("stack blob is not UTF-8: {}", e)))?;
        self.store
            .set_data(chat_key, STATE_STACK_KEY, Value::String(blob))
            .await
    }
}

// =============================================================================
// State traits
// =============================================================================

/// A handler that can also render itself.
///
/// Names must be unique within one [`StateHandler`].
#[async_trait]
pub trait State<P: Platform>: Handler<P> {
    /// Produce the conversation's UI for this state. Called when the state is
    /// entered, and when it is returned to via [`StateHandler::back`].
    async fn render(&self, ctx: &Context<P>) -> Result<()>;
}

/// A state with a "next" slot, wired up by
/// [`StateHandler::register_and_chain_states`].
pub trait ChainableState<P: Platform>: State<P> {
    fn next(&self) -> &NextTransition<P>;
}

/// Shared, settable slot holding a state's next transition.
///
/// Clones share the slot, so a handler closure can capture the slot before
/// the chain is registered and still see the transition set later.
pub struct NextTransition<P: Platform> {
    owner: Arc<str>,
    slot: Arc<RwLock<Option<Transition<P>>>>,
}

impl<P: Platform> Clone for NextTransition<P> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<P: Platform> NextTransition<P> {
    /// An empty slot belonging to the state named `owner`.
    pub fn new(owner: &str) -> Self {
        Self {
            owner: Arc::from(owner),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Point the slot at `transition`, replacing what was there.
    pub fn set(&self, transition: Transition<P>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(transition);
    }

    /// The current transition, if set.
    pub fn get(&self) -> Option<Transition<P>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the transition in the slot.
    pub async fn go(&self, ctx: &Context<P>) -> Result<()> {
        let transition = self.get().ok_or_else(|| NabotError::NextTransitionUnset {
            state: self.owner.to_string(),
        })?;
        transition.go(ctx).await
    }
}

// =============================================================================
// State Handler
// =============================================================================

struct StateMachine<P: Platform> {
    states: DashMap<String, Arc<dyn State<P>>>,
    storage: Arc<dyn StateStorage>,
}

impl<P: Platform> StateMachine<P> {
    fn state(&self, name: &str) -> Option<Arc<dyn State<P>>> {
        self.states.get(name).map(|state| state.clone())
    }

    async fn get_stack(&self, chat_key: &str) -> Result<Vec<Arc<dyn State<P>>>, NabotError> {
        let blob = match self.storage.get_stack(chat_key).await {
            Ok(Some(blob)) => blob,
            Ok(None) | Err(StorageError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let names: Vec<String> = match serde_json::from_slice(&blob) {
            Ok(names) => names,
            Err(e) => {
                error!(
                    chat_key,
                    error = %e,
                    "failed to unmarshal stored stack; skipping state handler"
                );
                return Ok(Vec::new());
            }
        };

        Ok(names
            .iter()
            .filter_map(|name| {
                let state = self.state(name);
                if state.is_none() {
                    warn!(chat_key, state = %name, "dropping unregistered state from stack");
                }
                state
            })
            .collect())
    }

    async fn set_stack(&self, chat_key: &str, stack: &[Arc<dyn State<P>>]) -> Result<(), NabotError> {
        let names: Vec<&str> = stack
            .iter()
            .map(|state| state.name())
            .filter(|name| self.states.contains_key(*name))
            .collect();
        let blob = serde_json::to_vec(&names).map_err(NabotError::EncodeStack)?;
        self.storage.set_stack(chat_key, blob).await?;
        Ok(())
    }
}

/// Routes updates to the state on top of each conversation's stack.
///
/// Register it in the app's handler chain like any other handler. With no
/// active state for a conversation it declines, so later handlers get the
/// update.
///
/// All states must be registered before the app starts dispatching.
pub struct StateHandler<P: Platform> {
    machine: Arc<StateMachine<P>>,
}

impl<P: Platform> Clone for StateHandler<P> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
        }
    }
}

impl<P: Platform> Default for StateHandler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> StateHandler<P> {
    /// State handler with in-memory stacks.
    pub fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryStateStore::new()))
    }

    /// State handler persisting stacks through `storage`.
    pub fn with_storage(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            machine: Arc::new(StateMachine {
                states: DashMap::new(),
                storage,
            }),
        }
    }

    /// Register a state and return a transition to it.
    ///
    /// # Panics
    ///
    /// Panics if a state with the same name is already registered. Use
    /// [`try_register_state`](Self::try_register_state) to get an error
    /// instead.
    pub fn register_state(&self, state: Arc<dyn State<P>>) -> Transition<P> {
        match self.try_register_state(state) {
            Ok(transition) => transition,
            Err(e) => panic!("nabot: {}", e),
        }
    }

    /// Register a state and return a transition to it, or
    /// [`NabotError::DuplicateState`].
    pub fn try_register_state(&self, state: Arc<dyn State<P>>) -> Result<Transition<P>, NabotError> {
        let name = state.name().to_string();
        match self.machine.states.entry(name.clone()) {
            Entry::Occupied(_) => return Err(NabotError::DuplicateState { name }),
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        debug!(state = %name, "registered state");
        Ok(self.transition_to(name))
    }

    /// Register states that form a linear flow.
    ///
    /// Each state's next slot is pointed at the state after it. The last
    /// state's slot is left alone: set it yourself, since the chain cannot
    /// know where to go past its end. Returns a transition to the first state.
    ///
    /// # Panics
    ///
    /// Panics on an empty list or a duplicate name.
    pub fn register_and_chain_states(&self, states: Vec<Arc<dyn ChainableState<P>>>) -> Transition<P> {
        match self.try_register_and_chain_states(states) {
            Ok(transition) => transition,
            Err(e) => panic!("nabot: {}", e),
        }
    }

    /// Fallible form of [`register_and_chain_states`](Self::register_and_chain_states).
    ///
    /// On error nothing is registered and no next slot is touched.
    pub fn try_register_and_chain_states(
        &self,
        states: Vec<Arc<dyn ChainableState<P>>>,
    ) -> Result<Transition<P>, NabotError> {
        let Some(first) = states.first() else {
            return Err(NabotError::EmptyStateChain);
        };
        let first = first.name().to_string();

        let mut seen = HashSet::new();
        for state in &states {
            if !seen.insert(state.name()) {
                return Err(NabotError::DuplicateState {
                    name: state.name().to_string(),
                });
            }
        }

        let mut inserted: Vec<String> = Vec::with_capacity(states.len());
        for state in &states {
            let name = state.name().to_string();
            match self.machine.states.entry(name.clone()) {
                Entry::Occupied(_) => {
                    for name in &inserted {
                        self.machine.states.remove(name);
                    }
                    return Err(NabotError::DuplicateState { name });
                }
                Entry::Vacant(slot) => {
                    let state: Arc<dyn State<P>> = state.clone();
                    slot.insert(state);
                    inserted.push(name);
                }
            }
        }

        for pair in states.windows(2) {
            pair[0].next().set(self.transition_to(pair[1].name().to_string()));
        }
        debug!(states = ?inserted, "registered state chain");
        Ok(self.transition_to(first))
    }

    fn transition_to(&self, name: String) -> Transition<P> {
        Transition {
            machine: Arc::downgrade(&self.machine),
            kind: TransitionKind::To(name),
        }
    }

    /// Transition that goes back to the previous state.
    pub fn back(&self) -> Transition<P> {
        Transition {
            machine: Arc::downgrade(&self.machine),
            kind: TransitionKind::Back,
        }
    }

    /// Names on a conversation's stack, bottom first.
    pub async fn current_stack(&self, chat_key: &str) -> Result<Vec<String>, NabotError> {
        let stack = self.machine.get_stack(chat_key).await?;
        Ok(stack.iter().map(|state| state.name().to_string()).collect())
    }

    /// Names of all registered states.
    pub fn registered_states(&self) -> Vec<String> {
        self.machine
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for StateHandler<P> {
    fn name(&self) -> &str {
        "state_handler"
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        let stack = self.machine.get_stack(ctx.chat_key()).await?;
        let Some(top) = stack.last() else {
            return Ok(Outcome::Declined);
        };
        let state_ctx = ctx.for_state(top.name());
        let span = state_ctx.span().clone();
        top.handle(&state_ctx).instrument(span).await
    }
}

impl<P: Platform> std::fmt::Debug for StateHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandler")
            .field("state_count", &self.machine.states.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Transition
// =============================================================================

/// What a transition does to the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
    /// Enter the named state, truncating back to it if already on the stack.
    To(String),
    /// Pop the top state.
    Back,
}

/// A reusable stack mutation. Holds no per-conversation data, so one value
/// can be shared by every conversation and invoked concurrently.
pub struct Transition<P: Platform> {
    machine: Weak<StateMachine<P>>,
    kind: TransitionKind,
}

impl<P: Platform> Clone for Transition<P> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl<P: Platform> Transition<P> {
    pub fn kind(&self) -> &TransitionKind {
        &self.kind
    }

    /// Apply the transition to the context's conversation and render the
    /// resulting top state.
    pub async fn go(&self, ctx: &Context<P>) -> Result<()> {
        let machine = self
            .machine
            .upgrade()
            .ok_or(NabotError::StateMachineDropped)?;

        match &self.kind {
            TransitionKind::To(name) => {
                let target = machine
                    .state(name)
                    .ok_or_else(|| NabotError::StateNotRegistered { name: name.clone() })?;

                let mut stack = machine.get_stack(ctx.chat_key()).await?;
                match stack.iter().position(|state| state.name() == name.as_str()) {
                    Some(index) => stack.truncate(index + 1),
                    None => stack.push(target.clone()),
                }
                machine.set_stack(ctx.chat_key(), &stack).await?;
                debug!(state = %name, depth = stack.len(), "entered state");

                render(&target, ctx).await
            }
            TransitionKind::Back => {
                let mut stack = machine.get_stack(ctx.chat_key()).await?;
                let Some(left) = stack.pop() else {
                    return Ok(());
                };
                machine.set_stack(ctx.chat_key(), &stack).await?;
                debug!(state = left.name(), depth = stack.len(), "left state");

                match stack.last() {
                    Some(top) => render(top, ctx).await,
                    None => Ok(()),
                }
            }
        }
    }
}

async fn render<P: Platform>(state: &Arc<dyn State<P>>, ctx: &Context<P>) -> Result<()> {
    let state_ctx = ctx.for_state(state.name());
    let span = state_ctx.span().clone();
    state.render(&state_ctx).instrument(span).await
}

impl<P: Platform> std::fmt::Debug for Transition<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition").field("kind", &self.kind).finish()
    }
}

// =============================================================================
// Base State
// =============================================================================

type Renderer<P> = Arc<dyn Fn(Context<P>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A state assembled from parts: an id, a render callback, sub-handlers tried
/// in order, and a next slot.
///
/// # Example
///
/// ```ignore
/// let state = BaseState::new("greeting");
/// let next = state.next().clone();
/// let state = state
///     .with_renderer(|ctx| async move { ctx.bot().send(*ctx.chat_id(), "Hi! Ready?").await })
///     .with_handler(KeyboardButton::new("Ready", move |ctx| {
///         let next = next.clone();
///         async move { next.go(&ctx).await }
///     }));
/// ```
pub struct BaseState<P: Platform> {
    id: String,
    renderer: Option<Renderer<P>>,
    handlers: Vec<Arc<dyn Handler<P>>>,
    next: NextTransition<P>,
}

impl<P: Platform> BaseState<P> {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            next: NextTransition::new(&id),
            id,
            renderer: None,
            handlers: Vec::new(),
        }
    }

    /// Set the render callback. Without one, rendering does nothing.
    pub fn with_renderer<F, Fut>(mut self, renderer: F) -> Self
    where
        F: Fn(Context<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.renderer = Some(Arc::new(move |ctx| renderer(ctx).boxed()));
        self
    }

    /// Append a sub-handler.
    pub fn with_handler(mut self, handler: impl Handler<P>) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Preset the next transition (for the last state of a chain).
    pub fn with_next(self, transition: Transition<P>) -> Self {
        self.next.set(transition);
        self
    }

    /// Wrap up for [`StateHandler::register_and_chain_states`].
    pub fn into_chainable(self) -> Arc<dyn ChainableState<P>> {
        Arc::new(self)
    }

    /// Wrap up for [`StateHandler::register_state`].
    pub fn into_state(self) -> Arc<dyn State<P>> {
        Arc::new(self)
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for BaseState<P> {
    fn name(&self) -> &str {
        &self.id
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        handle_chain(&self.handlers, ctx).await.into_result()
    }
}

#[async_trait]
impl<P: Platform> State<P> for BaseState<P> {
    async fn render(&self, ctx: &Context<P>) -> Result<()> {
        match &self.renderer {
            Some(renderer) => renderer(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

impl<P: Platform> ChainableState<P> for BaseState<P> {
    fn next(&self) -> &NextTransition<P> {
        &self.next
    }
}

impl<P: Platform> std::fmt::Debug for BaseState<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseState")
            .field("id", &self.id)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
