//! Session-bound sync pipeline: wait for login, fetch every endpoint, hand off to the writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clientele_adapters::{normalize, EndpointRecord};
use clientele_core::{Client, EndpointKind, FetchResult, Message, Opportunity};
use clientele_session::{fetch_in_page, BrowserSession, ChromeSessionConfig};
use clientele_storage::{write_sync, PersistenceError, SyncStore, WriteSummary};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clientele-sync";

const DEFAULT_API_BASE: &str = "https://dashboard.clientbook.com";
const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrls {
    pub clients: String,
    pub messages: String,
    pub opportunities: String,
}

impl EndpointUrls {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            clients: format!("{base}/api/clients"),
            messages: format!("{base}/api/messages"),
            opportunities: format!("{base}/api/opportunities"),
        }
    }

    pub fn for_kind(&self, kind: EndpointKind) -> &str {
        match kind {
            EndpointKind::Clients => &self.clients,
            EndpointKind::Messages => &self.messages,
            EndpointKind::Opportunities => &self.opportunities,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub login_url: String,
    pub endpoints: EndpointUrls,
    pub login_timeout_secs: u64,
    pub database_url: Option<String>,
    pub browser: ChromeSessionConfig,
    pub reports_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let base = get("CLIENTBOOK_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let base = base.trim_end_matches('/').to_string();
        let defaults = EndpointUrls::from_base(&base);

        Self {
            login_url: get("CLIENTBOOK_LOGIN_URL").unwrap_or_else(|| format!("{base}/login")),
            endpoints: EndpointUrls {
                clients: get("CLIENTBOOK_API_CLIENTS").unwrap_or(defaults.clients),
                messages: get("CLIENTBOOK_API_MESSAGES").unwrap_or(defaults.messages),
                opportunities: get("CLIENTBOOK_API_OPPORTUNITIES")
                    .unwrap_or(defaults.opportunities),
            },
            login_timeout_secs: get("CLIENTBOOK_LOGIN_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_LOGIN_TIMEOUT_SECS),
            database_url: get("DATABASE_URL"),
            browser: ChromeSessionConfig {
                headless: get("CLIENTELE_HEADLESS")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
                user_data_dir: get("CLIENTELE_USER_DATA_DIR").map(PathBuf::from),
            },
            reports_dir: get("CLIENTELE_REPORTS_DIR").map(PathBuf::from),
        }
    }

    pub fn login_wait(&self) -> LoginWaitConfig {
        LoginWaitConfig {
            login_url: self.login_url.clone(),
            timeout: Duration::from_secs(self.login_timeout_secs),
            ..LoginWaitConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginWaitConfig {
    pub login_url: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Extra pause after login is detected so the landing view can finish loading.
    pub settle_delay: Duration,
}

impl Default for LoginWaitConfig {
    fn default() -> Self {
        Self {
            login_url: format!("{DEFAULT_API_BASE}/login"),
            timeout: Duration::from_secs(DEFAULT_LOGIN_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    Navigating,
    AwaitingLogin,
    Authenticated,
    TimedOut,
    NavigationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated { landed_url: String, waited: Duration },
    TimedOut { waited: Duration },
    NavigationFailed { reason: String },
}

/// Path of a URL with the trailing slash removed and ASCII case folded.
fn comparable_path(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    Some(url.path().trim_end_matches('/').to_ascii_lowercase())
}

/// Drives a session through the interactive login and reports how it ended.
pub struct SessionAcquirer<'a> {
    session: &'a dyn BrowserSession,
    config: LoginWaitConfig,
    state: LoginState,
}

impl<'a> SessionAcquirer<'a> {
    pub fn new(session: &'a dyn BrowserSession, config: LoginWaitConfig) -> Self {
        Self {
            session,
            config,
            state: LoginState::Idle,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    fn transition(&mut self, next: LoginState) {
        debug!(from = ?self.state, to = ?next, "login state transition");
        self.state = next;
    }

    pub async fn acquire(&mut self) -> LoginOutcome {
        self.transition(LoginState::Navigating);
        let login_path = comparable_path(&self.config.login_url).unwrap_or_default();
        if let Err(err) = self.session.navigate(&self.config.login_url).await {
            self.transition(LoginState::NavigationFailed);
            return LoginOutcome::NavigationFailed {
                reason: err.to_string(),
            };
        }

        self.transition(LoginState::AwaitingLogin);
        info!(login_url = %self.config.login_url, "please log in; waiting for redirect");

        let started = Instant::now();
        let deadline = started + self.config.timeout;
        // interval() panics on a zero period
        let period = self.config.poll_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(started + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let session = self.session;

        loop {
            // A location check that never answers must not outlive the login timeout.
            let sample = tokio::time::timeout_at(deadline, async {
                ticker.tick().await;
                session.current_url().await
            })
            .await;
            let location = match sample {
                Err(_) => {
                    self.transition(LoginState::TimedOut);
                    return LoginOutcome::TimedOut {
                        waited: started.elapsed(),
                    };
                }
                Ok(Err(err)) => {
                    debug!(error = %err, "location sample failed; retrying next tick");
                    continue;
                }
                Ok(Ok(location)) => location,
            };
            let Some(path) = comparable_path(&location) else {
                debug!(%location, "unparseable location; retrying next tick");
                continue;
            };
            if path != login_path {
                self.transition(LoginState::Authenticated);
                let waited = started.elapsed();
                let settled = (Instant::now() + self.config.settle_delay).min(deadline);
                tokio::time::sleep_until(settled).await;
                return LoginOutcome::Authenticated {
                    landed_url: location,
                    waited,
                };
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("navigate to login: {0}")]
    Navigation(String),
    #[error("login timeout after {0} seconds")]
    LoginTimeout(u64),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Fetch one endpoint and decode it, recording any failure on `result` instead of returning it.
async fn fetch_endpoint<R: EndpointRecord>(
    session: &dyn BrowserSession,
    url: &str,
    result: &mut FetchResult,
) -> Vec<R> {
    let kind = R::KIND;
    let span = info_span!("endpoint", endpoint = kind.label(), url);
    async {
        let body = match fetch_in_page(session, url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to fetch {kind}");
                result.errors.push(format!("{kind}: {err}"));
                return Vec::new();
            }
        };
        match normalize::<R>(&body) {
            Ok(records) => {
                info!(count = records.len(), "fetched {kind}");
                records
            }
            Err(err) => {
                warn!(error = %err, "failed to parse {kind}");
                result.errors.push(format!("{kind} parse: {err}"));
                Vec::new()
            }
        }
    }
    .instrument(span)
    .await
}

/// Fetch all endpoints from an already-authenticated session, clients first.
pub async fn fetch_all(session: &dyn BrowserSession, endpoints: &EndpointUrls) -> FetchResult {
    let mut result = FetchResult::empty(Utc::now());
    result.clients =
        fetch_endpoint::<Client>(session, endpoints.for_kind(EndpointKind::Clients), &mut result).await;
    result.messages =
        fetch_endpoint::<Message>(session, endpoints.for_kind(EndpointKind::Messages), &mut result).await;
    result.opportunities = fetch_endpoint::<Opportunity>(
        session,
        endpoints.for_kind(EndpointKind::Opportunities),
        &mut result,
    )
    .await;
    result
}

/// Login, then fetch. Only a failed login is fatal; endpoint failures land in `errors`.
pub async fn run_session(
    session: &dyn BrowserSession,
    login: LoginWaitConfig,
    endpoints: &EndpointUrls,
) -> Result<FetchResult, SyncError> {
    let timeout_secs = login.timeout.as_secs();
    let mut acquirer = SessionAcquirer::new(session, login);
    match acquirer.acquire().await {
        LoginOutcome::Authenticated { landed_url, waited } => {
            info!(%landed_url, waited_secs = waited.as_secs(), "login detected; fetching data");
        }
        LoginOutcome::TimedOut { .. } => return Err(SyncError::LoginTimeout(timeout_secs)),
        LoginOutcome::NavigationFailed { reason } => return Err(SyncError::Navigation(reason)),
    }
    Ok(fetch_all(session, endpoints).await)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub clients: usize,
    pub messages: usize,
    pub opportunities: usize,
    /// `None` when persistence is disabled.
    pub write: Option<WriteSummary>,
    pub errors: Vec<String>,
}

impl SyncRunSummary {
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "fetched {} clients, {} messages, {} opportunities (run_id={})",
            self.clients, self.messages, self.opportunities, self.run_id
        )];
        match &self.write {
            Some(write) => lines.push(format!(
                "synced {} clients, {} messages, {} opportunities ({} messages, {} opportunities skipped: client not found)",
                write.clients_upserted,
                write.messages_upserted,
                write.opportunities_upserted,
                write.messages_skipped,
                write.opportunities_skipped
            )),
            None => lines.push("DATABASE_URL not set - skipped database writes".to_string()),
        }
        lines.extend(self.errors.iter().map(|e| format!("fetch error: {e}")));
        lines
    }
}

/// One full pass: login + fetch, then a single transactional write if a store is configured.
pub async fn run_sync_once(
    session: &dyn BrowserSession,
    config: &AgentConfig,
    store: Option<&dyn SyncStore>,
) -> Result<SyncRunSummary, SyncError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("sync_run", %run_id);
    sync_pass(run_id, session, config, store).instrument(span).await
}

async fn sync_pass(
    run_id: Uuid,
    session: &dyn BrowserSession,
    config: &AgentConfig,
    store: Option<&dyn SyncStore>,
) -> Result<SyncRunSummary, SyncError> {
    let started_at = Utc::now();
    let result = run_session(session, config.login_wait(), &config.endpoints).await?;
    let counts = result.record_counts();

    let write = match store {
        Some(store) => Some(write_sync(store, &result).await?),
        None => None,
    };

    Ok(SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        clients: counts.clients,
        messages: counts.messages,
        opportunities: counts.opportunities,
        write,
        errors: result.errors,
    })
}

/// Writes `<reports_dir>/<run_id>/sync_report.json` and returns its path.
pub async fn write_run_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("sync_report.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
