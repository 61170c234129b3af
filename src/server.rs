//! HTTP surface of the relay.
//!
//! `GET /` serves the embedded chat page, `POST /webhook` feeds Telegram
//! updates to the bot, `GET /set_webhook` registers that endpoint with
//! Telegram, and `POST /api/chat` streams a Gemini answer back as plain text.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::FormRejection,
        DefaultBodyLimit, FromRequest, Multipart, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use teloxide::types::Update;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::gemini::{ChatModel, GeminiClient, Part, TextStream};
use crate::image;
use crate::telegram::LazyGateway;

// The chat page is embedded at compile time.
const INDEX_HTML: &str = include_str!("../static/index.html");

/// Photos from phones are large; the page sends them as-is.
const BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Prefix of the in-band fragment that reports a failed answer.
pub const ERROR_PREFIX: &str = "Error: ";

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    /// `None` when no Gemini key is configured.
    model: Option<Arc<dyn ChatModel>>,
    /// `None` when no bot token is configured.
    telegram: Option<Arc<LazyGateway>>,
    webhook_url: Option<String>,
}

impl AppState {
    pub fn new(
        model: Option<Arc<dyn ChatModel>>,
        telegram: Option<Arc<LazyGateway>>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            model,
            telegram,
            webhook_url,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let model = match &config.gemini.api_key {
            Some(api_key) => {
                let client = GeminiClient::new(api_key.clone(), &config.gemini)?;
                info!("Gemini model: {}", client.model());
                Some(Arc::new(client) as Arc<dyn ChatModel>)
            }
            None => {
                warn!("GEMINI_API_KEY is not set; /api/chat will answer with an error");
                None
            }
        };

        let webapp_url = config.telegram.webapp_url().map(str::to_string);
        let telegram = match &config.telegram.bot_token {
            Some(token) => Some(Arc::new(LazyGateway::for_token(
                token.clone(),
                webapp_url.clone(),
            ))),
            None => {
                warn!("TELEGRAM_TOKEN is not set; /webhook is disabled");
                None
            }
        };

        if webapp_url.is_none() {
            warn!("WEBAPP_URL is not set; /set_webhook and /start will answer with an error");
        }

        Ok(Self::new(model, telegram, config.telegram.webhook_url()))
    }
}

// ── Errors ─────────────────────────────────────────────────────────────────────

/// Rejections of a chat request before any model call.
#[derive(Debug)]
enum ChatRequestError {
    Empty,
    Malformed(String),
    InvalidImage(anyhow::Error),
}

impl IntoResponse for ChatRequestError {
    fn into_response(self) -> Response {
        let message = match self {
            ChatRequestError::Empty => "Empty".to_string(),
            ChatRequestError::Malformed(e) => format!("Malformed form data: {e}"),
            ChatRequestError::InvalidImage(e) => format!("Invalid image: {e:#}"),
        };
        (StatusCode::BAD_REQUEST, message).into_response()
    }
}

impl From<MultipartError> for ChatRequestError {
    fn from(e: MultipartError) -> Self {
        ChatRequestError::Malformed(e.to_string())
    }
}

impl From<MultipartRejection> for ChatRequestError {
    fn from(e: MultipartRejection) -> Self {
        ChatRequestError::Malformed(e.to_string())
    }
}

impl From<FormRejection> for ChatRequestError {
    fn from(e: FormRejection) -> Self {
        ChatRequestError::Malformed(e.to_string())
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn telegram_webhook(State(state): State<AppState>, body: Bytes) -> (StatusCode, &'static str) {
    let Some(telegram) = state.telegram.as_ref() else {
        warn!("Webhook call rejected: TELEGRAM_TOKEN is not set");
        return (StatusCode::INTERNAL_SERVER_ERROR, "No Token");
    };

    // Telegram retries anything that is not a 2xx, so failures are only logged.
    if let Err(e) = process_webhook(telegram, &body).await {
        error!("Failed to process webhook update: {:#}", e);
    }

    (StatusCode::OK, "OK")
}

async fn process_webhook(telegram: &LazyGateway, body: &[u8]) -> Result<()> {
    let update: Update = serde_json::from_slice(body).context("Invalid update JSON")?;
    debug!("Webhook update {:?}", update.id);

    let gateway = telegram.get().await?;
    gateway.process_update(update).await
}

async fn set_webhook(State(state): State<AppState>) -> (StatusCode, String) {
    let (Some(telegram), Some(url)) = (state.telegram.as_ref(), state.webhook_url.as_deref())
    else {
        return (
            StatusCode::BAD_REQUEST,
            "Error: WEBAPP_URL or TELEGRAM_TOKEN is not configured".to_string(),
        );
    };

    match register_webhook(telegram, url).await {
        Ok(()) => {
            info!("Webhook set to {}", url);
            (StatusCode::OK, format!("Webhook set to: {url}"))
        }
        Err(e) => {
            error!("Failed to set webhook: {:#}", e);
            (StatusCode::OK, format!("Failed to set webhook: {e:#}"))
        }
    }
}

async fn register_webhook(telegram: &LazyGateway, url: &str) -> Result<()> {
    let gateway = telegram.get().await?;
    gateway.set_webhook(url).await
}

async fn chat(State(state): State<AppState>, request: Request) -> Response {
    let parts = match read_chat_request(request).await {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Chat request rejected: {:?}", e);
            return e.into_response();
        }
    };

    let Some(model) = state.model.clone() else {
        return plain_text(Body::from(format!(
            "{ERROR_PREFIX}Gemini API key is not configured"
        )));
    };

    info!("Chat request with {} part(s)", parts.len());
    plain_text(Body::from_stream(relay_chunks(model.stream_generate(parts))))
}

/// Text-only form as sent by plain HTML forms and `curl -d`.
#[derive(Debug, Deserialize)]
struct ChatForm {
    #[serde(default)]
    message: String,
}

fn is_urlencoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

async fn read_chat_request(request: Request) -> Result<Vec<Part>, ChatRequestError> {
    if is_urlencoded(request.headers()) {
        let Form(form) = Form::<ChatForm>::from_request(request, &()).await?;
        return chat_parts(form.message, None);
    }

    let multipart = Multipart::from_request(request, &()).await?;
    read_multipart(multipart).await
}

async fn read_multipart(mut multipart: Multipart) -> Result<Vec<Part>, ChatRequestError> {
    let mut message = String::new();
    let mut image_data: Option<Bytes> = None;
    let mut seen_field = false;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            // A form without a single field does not parse as multipart.
            Err(e) if !seen_field => {
                debug!("Multipart body without fields: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        seen_field = true;

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => message = field.text().await?,
            Some("image") => {
                let data = field.bytes().await?;
                // Browsers send an empty file part when nothing was picked.
                if !data.is_empty() {
                    image_data = Some(data);
                }
            }
            _ => {}
        }
    }

    chat_parts(message, image_data)
}

/// Model parts in request order: text first, then the image.
fn chat_parts(message: String, image_data: Option<Bytes>) -> Result<Vec<Part>, ChatRequestError> {
    let mut parts = Vec::new();
    if !message.is_empty() {
        parts.push(Part::Text(message));
    }
    if let Some(data) = image_data {
        let image = image::decode(data.to_vec()).map_err(ChatRequestError::InvalidImage)?;
        parts.push(Part::Image(image));
    }

    if parts.is_empty() {
        return Err(ChatRequestError::Empty);
    }
    Ok(parts)
}

/// Forward model chunks as body frames.
///
/// Empty chunks are skipped. A provider error ends the stream with one
/// `Error: ...` fragment; the HTTP status is already 200 by then.
fn relay_chunks(mut chunks: TextStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    async_stream::stream! {
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) if text.is_empty() => continue,
                Ok(text) => yield Ok::<_, Infallible>(Bytes::from(text)),
                Err(e) => {
                    warn!("Gemini stream failed: {:#}", e);
                    yield Ok(Bytes::from(format!("{ERROR_PREFIX}{e:#}")));
                    break;
                }
            }
        }
    }
}

fn plain_text(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

// ── Router ─────────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(serve_index))
        .route("/webhook", post(telegram_webhook))
        .route("/set_webhook", get(set_webhook))
        .route("/api/chat", post(chat))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// ── Tests ──────────────────────────────────────────────────────────────────────
