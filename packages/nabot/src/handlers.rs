//! Ready-made handlers for common update shapes.
//!
//! These only rely on [`Platform::message_text`] and
//! [`Platform::callback_data`], so they work with any transport that fills
//! those in.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::Context;
use crate::core::Platform;
use crate::handler::{Handler, Outcome};

type Callback<P, A, R> = Arc<dyn Fn(Context<P>, A) -> BoxFuture<'static, Result<R>> + Send + Sync>;

fn boxed<P, A, R, F, Fut>(f: F) -> Callback<P, A, R>
where
    P: Platform,
    F: Fn(Context<P>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    Arc::new(move |ctx, arg| f(ctx, arg).boxed())
}

// =============================================================================
// Func
// =============================================================================

/// A handler backed by a closure.
///
/// ```ignore
/// app.handle(Func::new(|ctx| async move {
///     to_main.go(&ctx).await?;
///     Ok(Outcome::Handled)
/// }));
/// ```
pub struct Func<P: Platform> {
    f: Callback<P, (), Outcome>,
}

impl<P: Platform> Func<P> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self {
            f: boxed(move |ctx, ()| f(ctx)),
        }
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for Func<P> {
    fn name(&self) -> &str {
        "function_handler"
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        (self.f)(ctx.clone(), ()).await
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Lets an update through only if the predicate holds.
///
/// When the predicate is false the update is consumed here and the chain
/// stops. Useful as an allowlist in front of everything else:
///
/// ```ignore
/// app.handle(Filter::new(|ctx| *ctx.chat_id() == ADMIN_CHAT));
/// ```
pub struct Filter<P: Platform> {
    predicate: Arc<dyn Fn(&Context<P>) -> bool + Send + Sync>,
}

impl<P: Platform> Filter<P> {
    pub fn new(predicate: impl Fn(&Context<P>) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for Filter<P> {
    fn name(&self) -> &str {
        "filter_handler"
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        if (self.predicate)(ctx) {
            Ok(Outcome::Declined)
        } else {
            Ok(Outcome::Handled)
        }
    }
}

// =============================================================================
// Text
// =============================================================================

/// Handles any non-empty text message.
pub struct Text<P: Platform> {
    name: String,
    f: Callback<P, String, ()>,
}

impl<P: Platform> Text<P> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context<P>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: boxed(f),
        }
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for Text<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        match P::message_text(ctx.update()) {
            Some(text) if !text.is_empty() => {
                (self.f)(ctx.clone(), text.to_string()).await?;
                Ok(Outcome::Handled)
            }
            _ => Ok(Outcome::Declined),
        }
    }
}

// =============================================================================
// Command
// =============================================================================

type Separator = Arc<dyn Fn(&str, &str) -> Vec<String> + Send + Sync>;

/// Handles a bot command such as `/start`.
///
/// The message must begin with the command, followed by whitespace, an
/// `@botname` suffix, or nothing. By default the rest of the text is split on
/// whitespace into arguments: for `/start 1 2 3` the callback gets
/// `["1", "2", "3"]`.
pub struct Command<P: Platform> {
    command: String,
    f: Callback<P, Vec<String>, ()>,
    separator: Option<Separator>,
}

impl<P: Platform> Command<P> {
    /// `command` may be given with or without the leading slash.
    pub fn new<F, Fut>(command: &str, f: F) -> Self
    where
        F: Fn(Context<P>, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let command = if command.starts_with('/') {
            command.to_string()
        } else {
            format!("/{}", command)
        };
        Self {
            command,
            f: boxed(f),
            separator: None,
        }
    }

    /// Replace argument splitting. The separator receives the command and the
    /// full message text.
    pub fn with_separator(
        mut self,
        separator: impl Fn(&str, &str) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.separator = Some(Arc::new(separator));
        self
    }

    fn arguments<'a>(&self, text: &'a str) -> Option<&'a str> {
        let rest = text.strip_prefix(self.command.as_str())?;
        match rest.chars().next() {
            None => Some(rest),
            Some(c) if c.is_whitespace() => Some(rest),
            Some('@') => Some(
                rest.split_once(char::is_whitespace)
                    .map(|(_, args)| args)
                    .unwrap_or(""),
            ),
            Some(_) => None,
        }
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for Command<P> {
    fn name(&self) -> &str {
        &self.command
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        let Some(text) = P::message_text(ctx.update()) else {
            return Ok(Outcome::Declined);
        };
        let Some(rest) = self.arguments(text) else {
            return Ok(Outcome::Declined);
        };
        let args = match &self.separator {
            Some(separator) => separator(&self.command, text),
            None => rest.split_whitespace().map(str::to_string).collect(),
        };
        (self.f)(ctx.clone(), args).await?;
        Ok(Outcome::Handled)
    }
}

// =============================================================================
// Buttons
// =============================================================================

const CALLBACK_DATA_SEPARATOR: char = '\\';

/// Handles inline-button callbacks whose data is `"<id>\<payload>"`.
///
/// ```ignore
/// let accept = InlineButton::new("accept", |ctx, request_id| async move { ... });
/// // When building the keyboard:
/// let data = accept.callback_data("42"); // "accept\42"
/// ```
pub struct InlineButton<P: Platform> {
    id: String,
    f: Callback<P, String, ()>,
}

impl<P: Platform> Clone for InlineButton<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            f: self.f.clone(),
        }
    }
}

impl<P: Platform> InlineButton<P> {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context<P>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            f: boxed(f),
        }
    }

    /// Button id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Callback data that routes a press back to this handler with `payload`.
    pub fn callback_data(&self, payload: &str) -> String {
        format!("{}{}{}", self.id, CALLBACK_DATA_SEPARATOR, payload)
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for InlineButton<P> {
    fn name(&self) -> &str {
        &self.id
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        let payload = P::callback_data(ctx.update())
            .and_then(|data| data.strip_prefix(self.id.as_str()))
            .and_then(|rest| rest.strip_prefix(CALLBACK_DATA_SEPARATOR));
        match payload {
            Some(payload) => {
                (self.f)(ctx.clone(), payload.to_string()).await?;
                Ok(Outcome::Handled)
            }
            None => Ok(Outcome::Declined),
        }
    }
}

/// Handles a reply-keyboard press, i.e. a message whose text equals the
/// button label.
pub struct KeyboardButton<P: Platform> {
    text: String,
    name: String,
    f: Callback<P, (), ()>,
}

impl<P: Platform> Clone for KeyboardButton<P> {
    fn clone(&self) -> Self {
        Self {
            text: self.text.clone(),
            name: self.name.clone(),
            f: self.f.clone(),
        }
    }
}

impl<P: Platform> KeyboardButton<P> {
    pub fn new<F, Fut>(text: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let text = text.into();
        Self {
            name: format!("reply_button_{}", text),
            text,
            f: boxed(move |ctx, ()| f(ctx)),
        }
    }

    /// Button label.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[async_trait]
impl<P: Platform> Handler<P> for KeyboardButton<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &Context<P>) -> Result<Outcome> {
        if P::message_text(ctx.update()) == Some(self.text.as_str()) {
            (self.f)(ctx.clone(), ()).await?;
            Ok(Outcome::Handled)
        } else {
            Ok(Outcome::Declined)
        }
    }
}
