//! The app: reads updates, routes them, runs the handler chain.
//!
//! Lifecycle only moves forward: `Idle`, `Running` while reading,
//! `Draining` once the channel closes, `Stopped` after `stop` has seen the
//! in-flight count reach zero. In-flight handlers are never cancelled by the
//! app; they can watch [`Context::cancellation`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::Context;
use crate::core::{default_chat_info, ChatInfoExtractor, Platform};
use crate::executor::{BoundedExecutor, Executor, SpawnExecutor};
use crate::handler::{handle_chain, panic_message, ChainOutcome, Handler};
use crate::storage::{DataStorage, InMemoryDataStore};

// =============================================================================
// Inflight Tracking
// =============================================================================

/// Counts updates that were accepted but not yet fully processed.
#[derive(Debug, Default)]
pub struct InflightTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement, waking waiters when the count reaches zero.
    pub fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inflight count underflow");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count is zero.
    ///
    /// Notify is edge-triggered, so this registers for the wakeup before
    /// checking the count and loops on every wakeup.
    pub async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard: increments on creation, decrements on drop.
///
/// Dropping happens on completion, on panic unwinding, and when the task is
/// dropped unfinished, so `stop` cannot hang on a lost update.
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl InflightGuard {
    pub fn new(tracker: Arc<InflightTracker>) -> Self {
        tracker.inc();
        Self { tracker }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.dec();
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Where an [`App`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Built, `run` not called yet.
    Idle = 0,
    /// Reading updates.
    Running = 1,
    /// Update source closed; in-flight updates still finishing.
    Draining = 2,
    /// `stop` observed zero in-flight updates.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Idle,
            1 => Lifecycle::Running,
            2 => Lifecycle::Draining,
            _ => Lifecycle::Stopped,
        }
    }
}

// =============================================================================
// Config & Builder
// =============================================================================

/// App settings.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Cap on updates processed at once. `None` (the default) spawns a task
    /// per update without limit. Ignored when an executor is set explicitly.
    pub max_concurrent_updates: Option<usize>,
}

/// Builder for [`App`].
pub struct AppBuilder<P: Platform> {
    bot: Arc<P::Bot>,
    config: AppConfig,
    executor: Option<Arc<dyn Executor>>,
    store: Option<Arc<dyn DataStorage>>,
    extractor: Option<ChatInfoExtractor<P>>,
    cancel: CancellationToken,
    handlers: Vec<Arc<dyn Handler<P>>>,
}

impl<P: Platform> AppBuilder<P> {
    pub fn new(bot: Arc<P::Bot>) -> Self {
        Self {
            bot,
            config: AppConfig::default(),
            executor: None,
            store: None,
            extractor: None,
            cancel: CancellationToken::new(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Run updates on a custom executor.
    pub fn with_executor(mut self, executor: impl Executor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Share a data store. Defaults to a fresh [`InMemoryDataStore`].
    pub fn with_data_store(mut self, store: Arc<dyn DataStorage>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the routing policy. Defaults to [`default_chat_info`].
    pub fn with_chat_info_extractor(mut self, extractor: ChatInfoExtractor<P>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Root token every context's cancellation token is a child of.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Append a handler to the chain. Order of calls is the order handlers
    /// are tried in.
    pub fn handle(mut self, handler: impl Handler<P>) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> App<P> {
        let executor: Arc<dyn Executor> = match (self.executor, self.config.max_concurrent_updates) {
            (Some(executor), _) => executor,
            (None, Some(limit)) => Arc::new(BoundedExecutor::new(limit)),
            (None, None) => Arc::new(SpawnExecutor),
        };

        App {
            inner: Arc::new(AppInner {
                bot: self.bot,
                handlers: self.handlers,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryDataStore::new())),
                extractor: self
                    .extractor
                    .unwrap_or_else(|| Arc::new(default_chat_info::<P>)),
                executor,
                inflight: Arc::new(InflightTracker::new()),
                lifecycle: AtomicU8::new(Lifecycle::Idle as u8),
                lifecycle_changed: Notify::new(),
                cancel: self.cancel,
            }),
        }
    }
}

// =============================================================================
// App
// =============================================================================

/// What became of one update.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// No conversation could be derived; dropped before dispatch.
    Ignored,
    /// The chain ran to completion.
    Chain(ChainOutcome),
    /// A handler or the chat info extractor panicked. Carries the panic
    /// message.
    Panicked(String),
}

struct AppInner<P: Platform> {
    bot: Arc<P::Bot>,
    handlers: Vec<Arc<dyn Handler<P>>>,
    store: Arc<dyn DataStorage>,
    extractor: ChatInfoExtractor<P>,
    executor: Arc<dyn Executor>,
    inflight: Arc<InflightTracker>,
    lifecycle: AtomicU8,
    lifecycle_changed: Notify,
    cancel: CancellationToken,
}

/// Dispatches updates through an ordered handler chain.
///
/// Cheap to clone; clones share everything.
pub struct App<P: Platform> {
    inner: Arc<AppInner<P>>,
}

impl<P: Platform> Clone for App<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Platform> App<P> {
    pub fn builder(bot: Arc<P::Bot>) -> AppBuilder<P> {
        AppBuilder::new(bot)
    }

    /// Read updates until the sender side closes, submitting each to the
    /// executor. Returns without waiting for submitted updates; call
    /// [`stop`](Self::stop) for that.
    ///
    /// An app runs once. Calling this on an app that already started or
    /// stopped logs a warning and returns.
    pub async fn run(&self, mut updates: mpsc::Receiver<P::Update>) {
        if !self.advance(Lifecycle::Idle, Lifecycle::Running) {
            warn!(lifecycle = ?self.lifecycle(), "app already started; not reading updates");
            return;
        }
        info!(handlers = self.inner.handlers.len(), "app started");

        while let Some(update) = updates.recv().await {
            self.submit(update);
        }

        self.advance(Lifecycle::Running, Lifecycle::Draining);
        info!(in_flight = self.in_flight(), "update source closed; draining");
    }

    /// Wait for the update source to close, then for every accepted update
    /// to finish.
    ///
    /// On an app that never ran this moves straight to draining, and a later
    /// [`run`](Self::run) is refused.
    pub async fn stop(&self) {
        loop {
            let changed = self.inner.lifecycle_changed.notified();
            match self.lifecycle() {
                Lifecycle::Idle => {
                    self.advance(Lifecycle::Idle, Lifecycle::Draining);
                }
                Lifecycle::Running => changed.await,
                Lifecycle::Draining => break,
                Lifecycle::Stopped => return,
            }
        }

        self.inner.inflight.wait_zero().await;
        if self.advance(Lifecycle::Draining, Lifecycle::Stopped) {
            info!("app stopped");
        }
    }

    /// Process one update on the current task and report what happened.
    /// Counted as in flight while it runs.
    pub async fn handle_update(&self, update: P::Update) -> UpdateOutcome {
        let _guard = InflightGuard::new(self.inner.inflight.clone());
        self.inner.process(update).await
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    /// Updates accepted but not yet fully processed.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.count()
    }

    /// The shared data store.
    pub fn store(&self) -> &Arc<dyn DataStorage> {
        &self.inner.store
    }

    fn submit(&self, update: P::Update) {
        let guard = InflightGuard::new(self.inner.inflight.clone());
        let inner = self.inner.clone();
        self.inner.executor.execute(
            async move {
                let _guard = guard;
                inner.process(update).await;
            }
            .boxed(),
        );
    }

    /// Move from `from` to `to`. False if the app was not at `from`.
    fn advance(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let moved = self
            .inner
            .lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.inner.lifecycle_changed.notify_waiters();
        }
        moved
    }
}

impl<P: Platform> AppInner<P> {
    async fn process(&self, update: P::Update) -> UpdateOutcome {
        let update_type = P::update_kind(&update);
        let chat = match panic::catch_unwind(AssertUnwindSafe(|| (self.extractor)(&update))) {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                warn!(update_type, "could not determine context; ignoring update");
                return UpdateOutcome::Ignored;
            }
            Err(panic_info) => {
                let message = panic_message(&panic_info);
                error!(update_type, panic = %message, "chat info extractor panicked");
                return UpdateOutcome::Panicked(message);
            }
        };
        let chat_key = chat.key.clone();

        let ctx = Context::new(self.bot.clone(), update, self.store.clone(), chat)
            .with_cancellation(self.cancel.child_token());
        let span = ctx.span().clone();

        let result = AssertUnwindSafe(handle_chain(&self.handlers, &ctx))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        span.in_scope(|| match result {
            Ok(outcome) => {
                match &outcome {
                    ChainOutcome::Handled { handler, .. } => {
                        debug!(handler = %handler, "update handled");
                    }
                    ChainOutcome::Failed { handler, error, .. } => {
                        error!(
                            handler = %handler,
                            chat_key = %chat_key,
                            error = ?error,
                            "handler failed"
                        );
                    }
                    ChainOutcome::Unhandled => {
                        info!("update was not handled by any handler");
                    }
                }
                UpdateOutcome::Chain(outcome)
            }
            Err(panic_info) => {
                let message = panic_message(&panic_info);
                error!(chat_key = %chat_key, panic = %message, "handler panicked");
                UpdateOutcome::Panicked(message)
            }
        })
    }
}

impl<P: Platform> std::fmt::Debug for App<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("handlers", &self.inner.handlers.len())
            .field("lifecycle", &self.lifecycle())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChatInfo;
    use crate::handler::Outcome;
    use crate::handlers::{Func, Text};
    use crate::testing::{RecordingBot, TestPlatform, TestUpdate};
    use std::time::Duration;

    fn echo() -> Text<TestPlatform> {
        Text::new("echo", |ctx: Context<TestPlatform>, text: String| async move {
            ctx.bot().send(*ctx.chat_id(), text);
            Ok(())
        })
    }

    // =========================================================================
    // Inflight
    // =========================================================================

    #[tokio::test]
    async fn test_wait_zero_returns_immediately_when_idle() {
        let tracker = InflightTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_zero())
            .await
            .expect("wait_zero should not block at zero");
    }

    #[tokio::test]
    async fn test_guard_drop_wakes_waiter() {
        let tracker = Arc::new(InflightTracker::new());
        let guard = InflightGuard::new(tracker.clone());
        assert_eq!(tracker.count(), 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_zero().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(tracker.count(), 0);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    #[tokio::test]
    async fn test_handle_update_runs_chain() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone()).handle(echo()).build();

        let outcome = app.handle_update(TestUpdate::message(5, "hello")).await;

        assert!(matches!(
            outcome,
            UpdateOutcome::Chain(ChainOutcome::Handled { index: 0, .. })
        ));
        assert_eq!(bot.sent_texts(5), vec!["hello"]);
        assert_eq!(app.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_update_without_conversation_is_ignored() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone())
            .handle(Func::new(|_ctx| async { panic!("must not run") }))
            .build();

        let outcome = app.handle_update(TestUpdate::default()).await;

        assert!(matches!(outcome, UpdateOutcome::Ignored));
    }

    #[tokio::test]
    async fn test_custom_extractor_routes_by_user() {
        let bot = Arc::new(RecordingBot::new());
        let by_user: ChatInfoExtractor<TestPlatform> =
            Arc::new(|update: &TestUpdate| update.user.map(ChatInfo::from_id));
        let app = App::<TestPlatform>::builder(bot.clone())
            .with_chat_info_extractor(by_user)
            .handle(echo())
            .build();

        app.handle_update(TestUpdate::message(1, "hi").from_user(77)).await;
        let ignored = app.handle_update(TestUpdate::message(1, "no user")).await;

        assert_eq!(bot.sent_texts(77), vec!["hi"]);
        assert!(matches!(ignored, UpdateOutcome::Ignored));
    }

    #[tokio::test]
    async fn test_extractor_panic_is_contained() {
        let bot = Arc::new(RecordingBot::new());
        let broken: ChatInfoExtractor<TestPlatform> =
            Arc::new(|_update: &TestUpdate| -> Option<ChatInfo<i64>> {
                panic!("no routing today")
            });
        let app = App::<TestPlatform>::builder(bot.clone())
            .with_chat_info_extractor(broken)
            .handle(echo())
            .build();

        let outcome = app.handle_update(TestUpdate::message(1, "hi")).await;

        match outcome {
            UpdateOutcome::Panicked(message) => assert_eq!(message, "no routing today"),
            other => panic!("expected Panicked, got {:?}", other),
        }
        assert_eq!(app.in_flight(), 0);
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone())
            .handle(Func::new(|_ctx| async { Err(anyhow::anyhow!("db down")) }))
            .handle(echo())
            .build();

        let outcome = app.handle_update(TestUpdate::message(1, "hi")).await;

        match outcome {
            UpdateOutcome::Chain(ChainOutcome::Failed { handler, error, .. }) => {
                assert_eq!(handler, "function_handler");
                assert!(error.to_string().contains("db down"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot)
            .handle(Func::new(|_ctx| async { panic!("kaboom") }))
            .build();

        let outcome = app.handle_update(TestUpdate::message(1, "hi")).await;

        match outcome {
            UpdateOutcome::Panicked(message) => assert_eq!(message, "kaboom"),
            other => panic!("expected panic, got {:?}", other),
        }
        assert_eq!(app.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_all_declined_is_unhandled() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot)
            .handle(Func::new(|_ctx| async { Ok(Outcome::Declined) }))
            .build();

        let outcome = app.handle_update(TestUpdate::message(1, "hi")).await;
        assert!(matches!(outcome, UpdateOutcome::Chain(ChainOutcome::Unhandled)));
    }

    #[tokio::test]
    async fn test_contexts_inherit_cancellation() {
        let root = CancellationToken::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let app = App::<TestPlatform>::builder(Arc::new(RecordingBot::new()))
            .with_cancellation(root.clone())
            .handle(Func::new(move |ctx: Context<TestPlatform>| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(ctx.cancellation().clone());
                    Ok(Outcome::Handled)
                }
            }))
            .build();

        app.handle_update(TestUpdate::message(1, "hi")).await;
        let token = seen_rx.recv().await.unwrap();

        assert!(!token.is_cancelled());
        root.cancel();
        assert!(token.is_cancelled());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone()).handle(echo()).build();
        assert_eq!(app.lifecycle(), Lifecycle::Idle);

        let (tx, rx) = mpsc::channel(8);
        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };

        tx.send(TestUpdate::message(1, "one")).await.unwrap();
        tx.send(TestUpdate::message(2, "two")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(app.lifecycle(), Lifecycle::Running);

        drop(tx);
        runner.await.unwrap();
        assert_eq!(app.lifecycle(), Lifecycle::Draining);

        app.stop().await;
        assert_eq!(app.lifecycle(), Lifecycle::Stopped);
        assert_eq!(app.in_flight(), 0);
        assert_eq!(bot.sent_texts(1), vec!["one"]);
        assert_eq!(bot.sent_texts(2), vec!["two"]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_source_to_close() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone()).handle(echo()).build();

        let (tx, rx) = mpsc::channel(8);
        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };
        tx.send(TestUpdate::message(1, "one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopper = {
            let app = app.clone();
            tokio::spawn(async move { app.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopper.is_finished());
        assert_eq!(app.lifecycle(), Lifecycle::Running);

        // Still accepted while stop is waiting
        tx.send(TestUpdate::message(2, "two")).await.unwrap();
        drop(tx);
        runner.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), stopper)
            .await
            .expect("stop should finish once the source closes")
            .unwrap();

        assert_eq!(app.lifecycle(), Lifecycle::Stopped);
        assert_eq!(bot.sent_texts(2), vec!["two"]);
    }

    #[tokio::test]
    async fn test_stopped_app_does_not_run_again() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone()).handle(echo()).build();
        app.stop().await;
        assert_eq!(app.lifecycle(), Lifecycle::Stopped);

        let (tx, rx) = mpsc::channel(8);
        tx.send(TestUpdate::message(1, "late")).await.unwrap();
        drop(tx);
        app.run(rx).await;

        assert_eq!(app.lifecycle(), Lifecycle::Stopped);
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_config_limit_selects_bounded_executor() {
        let bot = Arc::new(RecordingBot::new());
        let app = App::<TestPlatform>::builder(bot.clone())
            .with_config(AppConfig {
                max_concurrent_updates: Some(1),
            })
            .handle(echo())
            .build();

        let (tx, rx) = mpsc::channel(8);
        for i in 0..5 {
            tx.send(TestUpdate::message(i, "x")).await.unwrap();
        }
        drop(tx);

        app.run(rx).await;
        app.stop().await;

        assert_eq!(bot.sent().len(), 5);
    }
}
