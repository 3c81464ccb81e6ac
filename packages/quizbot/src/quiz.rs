//! The quiz flow: pick a category ("main"), answer questions ("quiz"), go
//! back to pick another.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use nabot::{
    clear, App, AppConfig, BaseState, ChainableState, Command, Context, DataKey, Func,
    InlineButton, KeyboardButton, Outcome, StateHandler, StorageError, Text, Transition,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::console::{Console, ConsoleBot, InlineKey, Keyboard, Reply};

const WELCOME_MESSAGE: &str = "👋 Hi!\n\
Welcome to the quiz bot! 🎉\n\
Which topic should I ask you about? 🤔";

const CHANGE_CATEGORY_MESSAGE: &str = "🔄 Which topic should I ask you about now? 🤔";

const CORRECT_ANSWER_MESSAGE: &str = "🎉 Well done! That's correct! ✅\n\nAnother question? 😃";

const AGAIN_BUTTON: &str = "Ask me another";
const CHANGE_CATEGORY_BUTTON: &str = "No, I want another topic";

fn category_exit_message(category: &str) -> String {
    format!("✨ Hope you enjoyed the {} questions! 😊", category)
}

fn wrong_answer_message(correct: &str) -> String {
    format!("❌ Wrong! 😢\nThe right answer:\n*{}*\n\nAnother question? 😃", correct)
}

pub const CATEGORY: DataKey<String> = DataKey::new("category");
pub const CURRENT_QUESTION: DataKey<Question> = DataKey::new("current_question");

// =============================================================================
// Questions
// =============================================================================

pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub questions: &'static [QuestionDef],
}

pub struct QuestionDef {
    pub text: &'static str,
    pub options: &'static [&'static str],
    pub correct: usize,
}

/// The question a conversation is currently answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub options: Vec<String>,
    pub correct_index: usize,
}

impl Question {
    pub fn correct_option(&self) -> Option<&str> {
        self.options.get(self.correct_index).map(String::as_str)
    }
}

impl From<&QuestionDef> for Question {
    fn from(def: &QuestionDef) -> Self {
        Self {
            text: def.text.to_string(),
            options: def.options.iter().map(|o| o.to_string()).collect(),
            correct_index: def.correct,
        }
    }
}

pub static CATEGORIES: &[Category] = &[
    Category {
        id: "math",
        name: "Math",
        questions: &[
            QuestionDef {
                text: "Which of these numbers is the largest?",
                options: &["9!", "3^8", "2^10", "6! × 5!"],
                correct: 0,
            },
            QuestionDef {
                text: "In a group of 25 people, which is closest to the chance that two share a birthday?",
                options: &["6%", "12%", "25%", "50%"],
                correct: 3,
            },
            QuestionDef {
                text: "Which of these numbers is prime?",
                options: &["3171", "4153", "2873", "7051"],
                correct: 1,
            },
            QuestionDef {
                text: "Which of these is the smallest?",
                options: &["2^18", "3^12", "9!", "7^7"],
                correct: 0,
            },
        ],
    },
    Category {
        id: "history",
        name: "History",
        questions: &[
            QuestionDef {
                text: "Which Achaemenid king ordered the building of Persepolis?",
                options: &["Cyrus the Great", "Darius the Great", "Xerxes", "Artaxerxes I"],
                correct: 1,
            },
            QuestionDef {
                text: "Under which Qajar king did the Persian Constitutional Revolution take place?",
                options: &["Naser al-Din Shah", "Mozaffar al-Din Shah", "Mohammad Ali Shah", "Ahmad Shah"],
                correct: 1,
            },
            QuestionDef {
                text: "Which was the first Iranian dynasty after the arrival of Islam?",
                options: &["Samanids", "Saffarids", "Tahirids", "Ghaznavids"],
                correct: 2,
            },
            QuestionDef {
                text: "What was the capital of Iran under the Safavids?",
                options: &["Qazvin", "Shiraz", "Isfahan", "Tabriz"],
                correct: 2,
            },
        ],
    },
];

pub fn find_category(id: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|category| category.id == id)
}

// =============================================================================
// App
// =============================================================================

/// Wire up the quiz: `/start` first so it works in any state, then the
/// states, then a fallback that sends strays to the main menu.
pub fn build_app(bot: Arc<ConsoleBot>, config: AppConfig) -> App<Console> {
    let states = StateHandler::new();

    let to_main = states.register_and_chain_states(vec![main_state(), quiz_state(states.back())]);

    let start = {
        let to_main = to_main.clone();
        Command::new("start", move |ctx: Context<Console>, _args| {
            let to_main = to_main.clone();
            async move {
                clear(&ctx).await?;
                to_main.go(&ctx).await
            }
        })
    };

    let fallback = Func::new(move |ctx: Context<Console>| {
        let to_main = to_main.clone();
        async move {
            to_main.go(&ctx).await?;
            Ok(Outcome::Handled)
        }
    });

    App::builder(bot)
        .with_config(config)
        .handle(start)
        .handle(states)
        .handle(fallback)
        .build()
}

// =============================================================================
// Main state
// =============================================================================

fn main_state() -> Arc<dyn ChainableState<Console>> {
    let state = BaseState::new("main");
    let next = state.next().clone();

    let category_button = InlineButton::new("category", move |ctx: Context<Console>, category: String| {
        let next = next.clone();
        async move {
            if find_category(&category).is_none() {
                warn!(category = %category, "unknown category; ignoring");
                return Ok(());
            }
            CATEGORY.set(&ctx, category).await?;
            // Set by register_and_chain_states
            next.go(&ctx).await
        }
    });

    let button = category_button.clone();
    state
        .with_renderer(move |ctx| render_main(ctx, button.clone()))
        .with_handler(category_button)
        .into_chainable()
}

async fn render_main(ctx: Context<Console>, button: InlineButton<Console>) -> Result<()> {
    let chat_id = *ctx.chat_id();
    let mut text = WELCOME_MESSAGE;

    // Coming back from a quiz: hide its keyboard first
    match CATEGORY.get(&ctx).await {
        Ok(id) => {
            let name = find_category(&id).map_or(id.as_str(), |category| category.name);
            ctx.bot().send(
                Reply::new(chat_id, category_exit_message(name)).with_keyboard(Keyboard::Remove),
            )?;
            text = CHANGE_CATEGORY_MESSAGE;
        }
        Err(StorageError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let rows = CATEGORIES
        .iter()
        .map(|category| {
            vec![InlineKey {
                label: category.name.to_string(),
                data: button.callback_data(category.id),
            }]
        })
        .collect();
    ctx.bot()
        .send(Reply::new(chat_id, text).with_keyboard(Keyboard::Inline(rows)))
}

// =============================================================================
// Quiz state
// =============================================================================

fn quiz_state(back: Transition<Console>) -> Arc<dyn ChainableState<Console>> {
    // Last in the chain, so its next is set by hand
    let state = BaseState::new("quiz").with_next(back);
    let next = state.next().clone();

    let again = KeyboardButton::new(AGAIN_BUTTON, render_question);
    let change_category = KeyboardButton::new(CHANGE_CATEGORY_BUTTON, move |ctx: Context<Console>| {
        let next = next.clone();
        async move { next.go(&ctx).await }
    });

    state
        .with_renderer(render_question)
        .with_handler(again)
        .with_handler(change_category)
        .with_handler(Text::new("chosen_option", check_answer))
        .into_chainable()
}

async fn render_question(ctx: Context<Console>) -> Result<()> {
    let id = CATEGORY.get(&ctx).await?;
    let category = find_category(&id).ok_or_else(|| anyhow!("unknown category {:?}", id))?;
    let def = fastrand::choice(category.questions.iter())
        .ok_or_else(|| anyhow!("category {:?} has no questions", id))?;
    let question = Question::from(def);
    CURRENT_QUESTION.set(&ctx, question.clone()).await?;

    // Two options per row
    let rows = question
        .options
        .chunks(2)
        .map(|row| row.to_vec())
        .collect();
    ctx.bot().send(
        Reply::new(*ctx.chat_id(), question.text).with_keyboard(Keyboard::Reply(rows)),
    )
}

async fn check_answer(ctx: Context<Console>, chosen: String) -> Result<()> {
    let question = CURRENT_QUESTION.get(&ctx).await?;
    let correct = question
        .correct_option()
        .ok_or_else(|| anyhow!("question {:?} has no correct option", question.text))?;

    let text = if chosen == correct {
        CORRECT_ANSWER_MESSAGE.to_string()
    } else {
        wrong_answer_message(correct)
    };
    let keyboard = Keyboard::Reply(vec![vec![
        CHANGE_CATEGORY_BUTTON.to_string(),
        AGAIN_BUTTON.to_string(),
    ]]);
    ctx.bot()
        .send(Reply::new(*ctx.chat_id(), text).with_keyboard(keyboard))
}
