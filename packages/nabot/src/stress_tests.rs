//! Stress tests for the dispatcher and the state machine.
//!
//! Many conversations at once, random handler latency, panics mixed into
//! the stream, and shutdown while work is still running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::Context;
use crate::engine::{App, Lifecycle, UpdateOutcome};
use crate::executor::BoundedExecutor;
use crate::handler::{ChainOutcome, Outcome};
use crate::handlers::{Command, Func, Text};
use crate::state::{BaseState, StateHandler};
use crate::storage::{DataKey, DataStorage, InMemoryDataStore};
use crate::testing::{RecordingBot, TestPlatform, TestUpdate};

const COUNTER: DataKey<u32> = DataKey::new("counter");

async fn jitter(max_ms: u64) {
    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_ms))).await;
}

// ==========================================================================
// Isolation
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conversations_stay_isolated() {
    const CHATS: i64 = 50;

    let bot = Arc::new(RecordingBot::new());
    let store: Arc<dyn DataStorage> = Arc::new(InMemoryDataStore::new());
    let app = App::<TestPlatform>::builder(bot.clone())
        .with_data_store(store.clone())
        .handle(Text::new("remember", |ctx: Context<TestPlatform>, text: String| async move {
            jitter(5).await;
            let value: u32 = text.parse()?;
            COUNTER.set(&ctx, value).await?;
            jitter(5).await;
            let read_back = COUNTER.get(&ctx).await?;
            ctx.bot().send(*ctx.chat_id(), read_back.to_string());
            Ok(())
        }))
        .build();

    let (tx, rx) = mpsc::channel(16);
    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run(rx).await })
    };
    for chat in 0..CHATS {
        tx.send(TestUpdate::message(chat, &(chat * 10).to_string()))
            .await
            .unwrap();
    }
    drop(tx);
    runner.await.unwrap();
    app.stop().await;

    for chat in 0..CHATS {
        assert_eq!(bot.sent_texts(chat), vec![(chat * 10).to_string()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_stacks_isolated_under_load() {
    const CHATS: i64 = 40;

    let bot = Arc::new(RecordingBot::new());
    let states = StateHandler::<TestPlatform>::new();

    let second = BaseState::new("second").with_next(states.back());
    let to_first = states.register_and_chain_states(vec![
        BaseState::new("first").into_chainable(),
        second.into_chainable(),
    ]);

    let app = {
        let to_first = to_first.clone();
        App::<TestPlatform>::builder(bot.clone())
            .handle(Command::new("start", move |ctx: Context<TestPlatform>, _args| {
                let to_first = to_first.clone();
                async move {
                    jitter(3).await;
                    to_first.go(&ctx).await
                }
            }))
            .build()
    };

    // One update per conversation so there is no same-conversation race
    let mut handles = Vec::new();
    for chat in 0..CHATS {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            app.handle_update(TestUpdate::message(chat, "/start")).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            UpdateOutcome::Chain(ChainOutcome::Handled { .. })
        ));
    }

    for chat in 0..CHATS {
        assert_eq!(
            states.current_stack(&chat.to_string()).await.unwrap(),
            vec!["first"]
        );
    }
}

// ==========================================================================
// Failure containment
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panics_do_not_block_other_updates() {
    let bot = Arc::new(RecordingBot::new());
    let app = App::<TestPlatform>::builder(bot.clone())
        .handle(Func::new(|ctx: Context<TestPlatform>| async move {
            jitter(5).await;
            if *ctx.chat_id() % 3 == 0 {
                panic!("chat {} exploded", ctx.chat_id());
            }
            Ok(Outcome::Declined)
        }))
        .handle(Text::new("echo", |ctx: Context<TestPlatform>, text: String| async move {
            ctx.bot().send(*ctx.chat_id(), text);
            Ok(())
        }))
        .build();

    let (tx, rx) = mpsc::channel(8);
    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run(rx).await })
    };
    for chat in 0..30 {
        tx.send(TestUpdate::message(chat, "ok")).await.unwrap();
    }
    drop(tx);
    runner.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), app.stop())
        .await
        .expect("stop hung after panics");

    assert_eq!(app.in_flight(), 0);
    for chat in 0..30 {
        let expected: Vec<String> = if chat % 3 == 0 {
            vec![]
        } else {
            vec!["ok".into()]
        };
        assert_eq!(bot.sent_texts(chat), expected, "chat {}", chat);
    }
}

// ==========================================================================
// Shutdown
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_slow_handlers() {
    let finished = Arc::new(AtomicUsize::new(0));
    let app = {
        let finished = finished.clone();
        App::<TestPlatform>::builder(Arc::new(RecordingBot::new()))
            .handle(Func::new(move |_ctx| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20 + fastrand::u64(0..30))).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Handled)
                }
            }))
            .build()
    };

    let (tx, rx) = mpsc::channel(32);
    for chat in 0..20 {
        tx.send(TestUpdate::message(chat, "slow")).await.unwrap();
    }
    drop(tx);

    app.run(rx).await;
    assert_eq!(app.lifecycle(), Lifecycle::Draining);

    app.stop().await;
    assert_eq!(finished.load(Ordering::SeqCst), 20);
    assert_eq!(app.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_app_never_exceeds_limit() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let app = {
        let running = running.clone();
        let peak = peak.clone();
        App::<TestPlatform>::builder(Arc::new(RecordingBot::new()))
            .with_executor(BoundedExecutor::new(3))
            .handle(Func::new(move |_ctx| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    jitter(10).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Outcome::Handled)
                }
            }))
            .build()
    };

    let (tx, rx) = mpsc::channel(64);
    for chat in 0..60 {
        tx.send(TestUpdate::message(chat % 7, "x")).await.unwrap();
    }
    drop(tx);

    app.run(rx).await;
    app.stop().await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}
