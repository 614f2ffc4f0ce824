mod logging;
mod shutdown;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clientele_session::ChromeSession;
use clientele_storage::{MemorySyncStore, PgSyncStore, SyncStore};
use clientele_sync::{run_sync_once, write_run_report, AgentConfig, SyncRunSummary};
use shutdown::ShutdownSignal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "clientele-cli")]
#[command(about = "Sync clients, messages and opportunities from the Clientbook dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open the dashboard, wait for login, fetch and persist.
    Sync(SyncArgs),
    /// Apply database migrations and exit.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Seconds to wait for the interactive login.
    #[arg(long, value_name = "SECS")]
    login_timeout: Option<u64>,
    #[arg(long)]
    headless: bool,
    /// Write a JSON run report under this directory.
    #[arg(long, value_name = "DIR")]
    reports_dir: Option<PathBuf>,
    /// Leave the browser open after syncing until it is closed or Ctrl+C is pressed.
    #[arg(long)]
    keep_open: bool,
    /// Run the writer against an in-memory store instead of DATABASE_URL.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(secs) = self.login_timeout {
            config.login_timeout_secs = secs;
        }
        if self.headless {
            config.browser.headless = true;
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = AgentConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(config, args).await,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            connect_store(url).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn connect_store(database_url: &str) -> Result<PgSyncStore> {
    let store = PgSyncStore::connect(database_url).await?;
    store.migrate().await?;
    Ok(store)
}

async fn open_store(config: &AgentConfig, dry_run: bool) -> Result<Option<Box<dyn SyncStore>>> {
    if dry_run {
        info!("dry run: writing to an in-memory store");
        return Ok(Some(Box::new(MemorySyncStore::new())));
    }
    match config.database_url.as_deref() {
        Some(url) => Ok(Some(Box::new(connect_store(url).await?))),
        None => {
            warn!("DATABASE_URL not set - skipping database writes");
            Ok(None)
        }
    }
}

async fn sync(mut config: AgentConfig, args: SyncArgs) -> Result<()> {
    args.apply(&mut config);

    let mut shutdown = ShutdownSignal::install()?;
    let store = open_store(&config, args.dry_run).await?;

    let session = ChromeSession::launch(&config.browser)
        .await
        .context("launching Chrome")?;
    let outcome = drive(&session, &config, store.as_deref(), &mut shutdown, args.keep_open).await;
    session.shutdown().await;
    if args.dry_run && outcome.is_ok() {
        println!("dry run: nothing was written to the database");
    }
    outcome
}

async fn drive(
    session: &ChromeSession,
    config: &AgentConfig,
    store: Option<&dyn SyncStore>,
    shutdown: &mut ShutdownSignal,
    keep_open: bool,
) -> Result<()> {
    let summary = tokio::select! {
        outcome = run_sync_once(session, config, store) => outcome?,
        _ = session.closed() => bail!("browser closed before sync completed"),
        signal = shutdown.recv() => bail!("{signal} received before sync completed"),
    };

    print_summary(&summary);
    if let Some(dir) = &config.reports_dir {
        let path = write_run_report(dir, &summary).await?;
        info!(report = %path.display(), "run report written");
    }

    if keep_open {
        println!("Sync complete. Close the browser window or press Ctrl+C to exit.");
        tokio::select! {
            _ = session.closed() => {}
            signal = shutdown.recv() => info!(signal, "shutting down"),
        }
    }
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    for line in summary.report_lines() {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_database(url: Option<&str>) -> AgentConfig {
        AgentConfig::from_lookup(|key| match key {
            "DATABASE_URL" => url.map(str::to_string),
            _ => None,
        })
    }

    #[test]
    fn bare_invocation_defaults_to_sync() {
        let cli = Cli::try_parse_from(["clientele-cli"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["clientele-cli", "sync", "--dry-run", "--login-timeout", "30"])
            .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.dry_run);
        assert_eq!(args.login_timeout, Some(30));
    }

    #[tokio::test]
    async fn dry_run_never_connects_to_the_database() {
        // Nothing listens on port 1; connecting would fail.
        let config = config_with_database(Some("postgres://nobody@127.0.0.1:1/none"));
        let store = open_store(&config, true).await.unwrap();
        assert!(store.is_some());
    }

    #[tokio::test]
    async fn missing_database_url_disables_writes() {
        let store = open_store(&config_with_database(None), false).await.unwrap();
        assert!(store.is_none());
    }
}
