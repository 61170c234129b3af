use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use reqwest::Url;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, WebAppInfo};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const START_TEXT: &str = "Tap the button below to open the Gemini AI chat 👇";
pub const OPEN_CHAT_BUTTON: &str = "💬 Open chat";
pub const MISSING_URL_TEXT: &str = "Error: WEBAPP_URL is not configured.";
pub const INVALID_URL_TEXT: &str = "Error: WEBAPP_URL is not a valid URL.";

/// Reply primitives the command handlers need.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()>;
}

#[async_trait]
impl Messenger for Bot {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.send_message(chat_id, text)
            .await
            .context("Failed to send message")?;
        Ok(())
    }

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()> {
        self.send_message(chat_id, text)
            .reply_markup(keyboard)
            .await
            .context("Failed to send message with keyboard")?;
        Ok(())
    }
}

/// What the HTTP layer needs from the bot.
#[async_trait]
pub trait TelegramGateway: Send + Sync {
    /// Run one webhook update through the handler tree.
    async fn process_update(&self, update: Update) -> Result<()>;

    /// Tell Telegram where to push updates.
    async fn set_webhook(&self, url: &str) -> Result<()>;
}

/// Settings injected into the command handlers.
#[derive(Debug, Clone, Default)]
pub struct StartSettings {
    pub webapp_url: Option<String>,
}

/// `/start`, `/start@some_bot` and `/start <payload>` all count.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}

/// Keyboard with a single Web App button opening `webapp_url`.
pub fn start_keyboard(webapp_url: &str) -> Result<InlineKeyboardMarkup> {
    let url = Url::parse(webapp_url)
        .with_context(|| format!("Invalid web app URL: {webapp_url}"))?;

    Ok(InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::web_app(OPEN_CHAT_BUTTON, WebAppInfo { url }),
    ]]))
}

/// The dispatch tree for webhook updates.
pub fn schema() -> UpdateHandler<anyhow::Error> {
    Update::filter_message()
        .filter(|msg: Message| msg.text().is_some_and(is_start_command))
        .endpoint(start_command)
}

async fn start_command(
    msg: Message,
    messenger: Arc<dyn Messenger>,
    settings: Arc<StartSettings>,
) -> Result<()> {
    info!("/start from chat {}", msg.chat.id.0);

    let Some(webapp_url) = settings.webapp_url.as_deref() else {
        return messenger.send_text(msg.chat.id, MISSING_URL_TEXT).await;
    };

    match start_keyboard(webapp_url) {
        Ok(keyboard) => {
            messenger
                .send_with_keyboard(msg.chat.id, START_TEXT, keyboard)
                .await
        }
        Err(e) => {
            warn!("{:#}", e);
            messenger.send_text(msg.chat.id, INVALID_URL_TEXT).await
        }
    }
}

/// teloxide-backed gateway.
pub struct BotRuntime {
    bot: Bot,
    messenger: Arc<dyn Messenger>,
    settings: Arc<StartSettings>,
    handler: UpdateHandler<anyhow::Error>,
}

impl BotRuntime {
    /// Build the bot and check the token with `getMe`.
    pub async fn connect(token: &str, webapp_url: Option<String>) -> Result<Self> {
        let bot = Bot::new(token);
        let me = bot
            .get_me()
            .await
            .context("Failed to initialize Telegram bot")?;
        info!("Telegram bot initialized as @{}", me.username());

        let messenger: Arc<dyn Messenger> = Arc::new(bot.clone());
        Ok(Self::new(bot, messenger, webapp_url))
    }

    pub fn new(bot: Bot, messenger: Arc<dyn Messenger>, webapp_url: Option<String>) -> Self {
        Self {
            bot,
            messenger,
            settings: Arc::new(StartSettings { webapp_url }),
            handler: schema(),
        }
    }
}

#[async_trait]
impl TelegramGateway for BotRuntime {
    async fn process_update(&self, update: Update) -> Result<()> {
        let update_id = update.id;
        let deps = dptree::deps![update, self.messenger.clone(), self.settings.clone()];

        match self.handler.dispatch(deps).await {
            ControlFlow::Break(result) => result,
            ControlFlow::Continue(_) => {
                debug!("Unhandled update: {:?}", update_id);
                Ok(())
            }
        }
    }

    async fn set_webhook(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("Invalid webhook URL: {url}"))?;
        self.bot
            .set_webhook(url)
            .await
            .context("Telegram rejected setWebhook")?;
        Ok(())
    }
}

type Connector =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn TelegramGateway>>> + Send + Sync>;

/// A gateway created on first use and shared for the rest of the process.
///
/// Concurrent first callers wait on the same initialisation; a failed
/// initialisation leaves the cell empty so the next request retries.
pub struct LazyGateway {
    cell: OnceCell<Arc<dyn TelegramGateway>>,
    connect: Connector,
}

impl LazyGateway {
    pub fn new<F, Fut>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn TelegramGateway>>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            connect: Box::new(move || connect().boxed()),
        }
    }

    /// Lazily connect a real bot for `token`.
    pub fn for_token(token: String, webapp_url: Option<String>) -> Self {
        Self::new(move || {
            let token = token.clone();
            let webapp_url = webapp_url.clone();
            async move {
                let runtime = BotRuntime::connect(&token, webapp_url).await?;
                Ok(Arc::new(runtime) as Arc<dyn TelegramGateway>)
            }
        })
    }

    pub async fn get(&self) -> Result<Arc<dyn TelegramGateway>> {
        self.cell
            .get_or_try_init(|| (self.connect)())
            .await
            .cloned()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// What a stub messenger was asked to send.
    #[derive(Debug, Clone)]
    pub struct Sent {
        pub chat_id: ChatId,
        pub text: String,
        pub keyboard: Option<InlineKeyboardMarkup>,
    }

    #[derive(Default)]
    pub struct RecordingMessenger {
        pub sent: Mutex<Vec<Sent>>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(Sent {
                chat_id,
                text: text.to_string(),
                keyboard: None,
            });
            Ok(())
        }

        async fn send_with_keyboard(
            &self,
            chat_id: ChatId,
            text: &str,
            keyboard: InlineKeyboardMarkup,
        ) -> Result<()> {
            self.sent.lock().unwrap().push(Sent {
                chat_id,
                text: text.to_string(),
                keyboard: Some(keyboard),
            });
            Ok(())
        }
    }

    pub fn message_update(text: &str) -> serde_json::Value {
        serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private", "first_name": "Ann" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "text": text
            }
        })
    }
}
