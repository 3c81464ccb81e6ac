//! Console transport: stdin lines in, printed replies out.
//!
//! Input lines:
//!
//! ```text
//! 42 /start              message "/start" in chat 42
//! 42 cb:category\math    button callback in chat 42
//! hello                  no chat; dropped by the app
//! ```

use std::fmt;
use std::io::BufRead;
use std::thread;

use anyhow::{anyhow, Context, Result};
use nabot::Platform;
use tokio::sync::mpsc;
use tracing::warn;

const CALLBACK_PREFIX: &str = "cb:";

/// Marker type wiring nabot to the console.
#[derive(Debug, Clone, Copy)]
pub struct Console;

impl Platform for Console {
    type Update = ConsoleUpdate;
    type ChatId = i64;
    type Bot = ConsoleBot;

    fn chat_id(update: &ConsoleUpdate) -> Option<i64> {
        update.chat_id
    }

    fn update_kind(update: &ConsoleUpdate) -> &'static str {
        if update.callback.is_some() {
            "callback_query"
        } else {
            "message"
        }
    }

    fn message_text(update: &ConsoleUpdate) -> Option<&str> {
        update.text.as_deref()
    }

    fn callback_data(update: &ConsoleUpdate) -> Option<&str> {
        update.callback.as_deref()
    }
}

/// One line of input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleUpdate {
    pub chat_id: Option<i64>,
    pub text: Option<String>,
    pub callback: Option<String>,
}

impl ConsoleUpdate {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

        let Ok(chat_id) = head.parse::<i64>() else {
            return Self {
                text: Some(line.to_string()),
                ..Self::default()
            };
        };

        let rest = rest.trim_start();
        match rest.strip_prefix(CALLBACK_PREFIX) {
            Some(data) => Self {
                chat_id: Some(chat_id),
                callback: Some(data.to_string()),
                ..Self::default()
            },
            None => Self {
                chat_id: Some(chat_id),
                text: Some(rest.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Read lines on a dedicated thread and pass them on through a channel.
///
/// The thread is detached. It ends at EOF, on a read error, or on the first
/// line after the receiver is dropped; until then it may sit in a blocking
/// read, which does not keep the runtime or the process alive.
pub fn spawn_line_reader<R>(reader: R, capacity: usize) -> Result<mpsc::Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    thread::Builder::new()
        .name("line-reader".into())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read input");
                        break;
                    }
                }
            }
        })
        .context("failed to start the input reader")?;
    Ok(rx)
}

// =============================================================================
// Replies
// =============================================================================

/// A labelled inline button carrying callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineKey {
    pub label: String,
    pub data: String,
}

/// Keyboard attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Keyboard {
    /// Leave whatever keyboard the chat has.
    #[default]
    None,
    /// Buttons under the message, answered with callbacks.
    Inline(Vec<Vec<InlineKey>>),
    /// Reply keyboard; pressing a key sends its label as a message.
    Reply(Vec<Vec<String>>),
    /// Hide the reply keyboard.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: i64,
    pub text: String,
    pub keyboard: Keyboard,
}

impl Reply {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            keyboard: Keyboard::None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = keyboard;
        self
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.text.lines() {
            writeln!(f, "[{}] {}", self.chat_id, line)?;
        }
        match &self.keyboard {
            Keyboard::None => {}
            Keyboard::Remove => writeln!(f, "[{}] (keyboard removed)", self.chat_id)?,
            Keyboard::Inline(rows) => {
                for row in rows {
                    let keys: Vec<String> = row
                        .iter()
                        .map(|key| format!("[{} => cb:{}]", key.label, key.data))
                        .collect();
                    writeln!(f, "[{}]   {}", self.chat_id, keys.join(" "))?;
                }
            }
            Keyboard::Reply(rows) => {
                for row in rows {
                    writeln!(f, "[{}]   | {} |", self.chat_id, row.join(" | "))?;
                }
            }
        }
        Ok(())
    }
}

/// Bot handle: queues replies for the printer.
#[derive(Debug, Clone)]
pub struct ConsoleBot {
    replies: mpsc::UnboundedSender<Reply>,
}

impl ConsoleBot {
    pub fn new(replies: mpsc::UnboundedSender<Reply>) -> Self {
        Self { replies }
    }

    pub fn send(&self, reply: Reply) -> Result<()> {
        self.replies
            .send(reply)
            .map_err(|_| anyhow!("console output closed"))
    }
}

/// Print replies to stdout until every bot handle is dropped.
pub async fn print_replies(mut replies: mpsc::UnboundedReceiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        print!("{}", reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, BufReader, Cursor, Read};
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_message() {
        let update = ConsoleUpdate::parse("42 /start now");
        assert_eq!(update.chat_id, Some(42));
        assert_eq!(update.text.as_deref(), Some("/start now"));
        assert_eq!(update.callback, None);
    }

    #[test]
    fn test_parse_callback() {
        let update = ConsoleUpdate::parse("  7   cb:category\\math ");
        assert_eq!(update.chat_id, Some(7));
        assert_eq!(update.callback.as_deref(), Some("category\\math"));
        assert_eq!(Console::update_kind(&update), "callback_query");
    }

    #[test]
    fn test_parse_without_chat() {
        let update = ConsoleUpdate::parse("hello there");
        assert_eq!(update.chat_id, None);
        assert_eq!(nabot::default_chat_info::<Console>(&update), None);
    }

    #[test]
    fn test_reply_display() {
        let reply = Reply::new(3, "Pick one").with_keyboard(Keyboard::Reply(vec![
            vec!["a".into(), "b".into()],
            vec!["c".into()],
        ]));
        assert_eq!(
            reply.to_string(),
            "[3] Pick one\n[3]   | a | b |\n[3]   | c |\n"
        );
    }

    #[tokio::test]
    async fn test_line_reader_delivers_lines_then_closes() {
        let mut lines = spawn_line_reader(Cursor::new("1 /start\n\n2 cb:x\n"), 1).unwrap();

        assert_eq!(lines.recv().await.as_deref(), Some("1 /start"));
        assert_eq!(lines.recv().await.as_deref(), Some(""));
        assert_eq!(lines.recv().await.as_deref(), Some("2 cb:x"));
        assert_eq!(lines.recv().await, None);
    }

    /// Input that never produces a byte, like a terminal nobody types into.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            loop {
                thread::park();
            }
        }
    }

    #[test]
    fn test_blocked_reader_does_not_hold_runtime_open() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let started = Instant::now();

        runtime.block_on(async {
            let mut lines = spawn_line_reader(BufReader::new(Silent), 1).unwrap();
            let waited = tokio::time::timeout(Duration::from_millis(20), lines.recv()).await;
            assert!(waited.is_err());
        });
        drop(runtime);

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_send_after_printer_gone_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bot = ConsoleBot::new(tx);
        drop(rx);
        assert!(bot.send(Reply::new(1, "lost")).is_err());
    }
}
