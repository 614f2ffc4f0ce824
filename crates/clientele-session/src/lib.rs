//! Interactive browser session + page-context fetches for the clientele sync agent.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "clientele-session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("reading page location failed: {0}")]
    Location(String),
    #[error("page script failed: {0}")]
    Script(String),
}

/// The capabilities the sync pipeline needs from a live, possibly logged-in browser tab.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;

    /// Evaluate an expression in the page, awaiting it if it yields a promise, and return the
    /// resulting string.
    async fn evaluate_to_string(&self, expression: &str) -> Result<String, SessionError>;
}

#[derive(Debug, Clone, Default)]
pub struct ChromeSessionConfig {
    /// Off by default: the login has to happen in a visible window.
    pub headless: bool,
    pub user_data_dir: Option<PathBuf>,
}

/// A Chrome tab driven over the DevTools protocol.
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl ChromeSession {
    pub async fn launch(config: &ChromeSessionConfig) -> Result<Self, SessionError> {
        let mut builder = BrowserConfig::builder();
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(dir) = &config.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        let browser_config = builder.build().map_err(SessionError::Launch)?;

        let (browser, handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        // The CDP connection only makes progress while its handler is polled.
        let (closed_tx, closed) = watch::channel(false);
        let handler = tokio::spawn(pump_events(handler, closed_tx));

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        Ok(Self {
            browser,
            page,
            handler,
            closed,
        })
    }

    /// Resolves once the browser connection is gone, e.g. the user closed the window.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        if closed.wait_for(|closed| *closed).await.is_err() {
            warn!("browser handler task ended without reporting closure");
        }
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.browser.close().await {
            debug!(error = %err, "browser close request failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

/// Polls the CDP event stream until it ends, then flags the browser as closed.
///
/// Event errors (undecodable messages and the like) do not end the connection.
async fn pump_events<S, E>(mut events: S, closed_tx: watch::Sender<bool>)
where
    S: Stream<Item = Result<(), E>> + Unpin,
    E: fmt::Display,
{
    while let Some(event) = events.next().await {
        if let Err(err) = event {
            warn!(error = %err, "browser event error");
        }
    }
    debug!("browser event stream ended");
    let _ = closed_tx.send(true);
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.page
            .url()
            .await
            .map_err(|e| SessionError::Location(e.to_string()))?
            .ok_or_else(|| SessionError::Location("page has no url".to_string()))
    }

    async fn evaluate_to_string(&self, expression: &str) -> Result<String, SessionError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(SessionError::Script)?;
        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| SessionError::Script(e.to_string()))?;
        result
            .into_value::<String>()
            .map_err(|e| SessionError::Script(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("API error: {}", describe_indicator(.indicator, .status_text.as_deref()))]
    Application {
        indicator: String,
        status_text: Option<String>,
    },
}

fn describe_indicator(indicator: &str, status_text: Option<&str>) -> String {
    match status_text {
        Some(text) if !text.is_empty() => format!("{indicator} {text}"),
        _ => indicator.to_string(),
    }
}

/// Builds the in-page script. Non-2xx responses and thrown exceptions are reported as an
/// embedded `error` object so they never surface as session failures.
pub fn page_fetch_script(url: &str) -> String {
    let quoted = serde_json::to_string(url).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(async () => {{
    try {{
        const r = await fetch({quoted}, {{ credentials: "include" }});
        if (!r.ok) {{
            return JSON.stringify({{ error: r.status, statusText: r.statusText }});
        }}
        const d = await r.json();
        return JSON.stringify(d);
    }} catch (e) {{
        return JSON.stringify({{ error: String(e && e.message ? e.message : e) }});
    }}
}})()"#
    )
}

/// Inspect a response body for the upstream `error` sentinel.
///
/// Only a top-level `error` key counts. `null`, `false`, `0` and `""` are treated as absent.
pub fn embedded_error(body: &str) -> Option<FetchError> {
    let JsonValue::Object(map) = serde_json::from_str::<JsonValue>(body).ok()? else {
        return None;
    };
    let indicator = match map.get("error")? {
        JsonValue::Null | JsonValue::Bool(false) => return None,
        JsonValue::String(s) if s.is_empty() => return None,
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) if n.as_f64() == Some(0.0) => return None,
        other => other.to_string(),
    };
    let status_text = map
        .get("statusText")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    Some(FetchError::Application {
        indicator,
        status_text,
    })
}

/// Single-shot fetch from inside an authenticated session; cookies ride along automatically.
pub async fn fetch_in_page(session: &dyn BrowserSession, url: &str) -> Result<String, FetchError> {
    let span = info_span!("page_fetch", url);
    fetch_and_classify(session, url).instrument(span).await
}

async fn fetch_and_classify(session: &dyn BrowserSession, url: &str) -> Result<String, FetchError> {
    let body = session.evaluate_to_string(&page_fetch_script(url)).await?;
    if let Some(err) = embedded_error(&body) {
        return Err(err);
    }
    debug!(bytes = body.len(), "page fetch succeeded");
    Ok(body)
}
