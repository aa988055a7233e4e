use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, warn};
use tokio::runtime::{Builder, Runtime};

use crate::engine::state::{LauncherEvent, UpdateState};
use crate::engine::{LauncherConfig, Session};
use crate::env::Layout;
use crate::networking::Timeouts;
use crate::networking::probe::ServerStatus;

mod archive;
mod assets;
mod engine;
mod env;
mod integrity;
mod locator;
mod networking;
mod process;
mod protocol;
mod storage;
#[cfg(test)]
mod test_support;
mod transfer;
mod util;

#[derive(Parser, Debug)]
#[command(
    name = "SA-MP Launcher",
    author,
    version,
    about = "Keeps a SA-MP game install current and connects it to its server"
)]
struct Cli {
    /// URL of the release manifest.
    #[arg(long, env = "SAMP_LAUNCHER_MANIFEST")]
    manifest_url: String,

    /// Directory for downloads, game files, assets and settings.
    #[arg(long)]
    app_dir: Option<PathBuf>,

    /// Settings namespace. Defaults to the server's hostname.
    #[arg(long)]
    product_name: Option<String>,

    #[arg(long, default_value_t = 1500)]
    probe_timeout_ms: u64,

    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    read_timeout_secs: u64,

    /// How often the server status is refreshed.
    #[arg(long, default_value_t = 15)]
    status_interval_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the server status.
    Status {
        /// Keep printing changes until interrupted.
        #[arg(long)]
        watch: bool,
        /// Print each snapshot as a JSON object.
        #[arg(long)]
        json: bool,
    },
    /// Install the latest release if the local one is outdated.
    Check,
    /// Start the game connected to the server.
    Connect {
        #[arg(long)]
        name: String,
    },
    /// Save the player name.
    Settings {
        #[arg(long)]
        name: String,
    },
    /// Print the news feed.
    News,
}

impl Cli {
    fn config(&self) -> LauncherConfig {
        let layout = self.app_dir.clone().map(Layout::new).unwrap_or_default();
        let mut config = LauncherConfig::new(self.manifest_url.clone(), layout);
        config.product_name = self.product_name.clone();
        config.probe_timeout = Duration::from_millis(self.probe_timeout_ms);
        config.timeouts = Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
        };
        config.status_interval = Duration::from_secs(self.status_interval_secs);
        config
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    let Some(runtime) = build_runtime() else {
        return ExitCode::FAILURE;
    };
    match runtime.block_on(run(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime() -> Option<Runtime> {
    match Runtime::new() {
        Ok(rt) => Some(rt),
        Err(err) => {
            warn!("failed to create multithreaded runtime ({err}); trying single-threaded runtime");
            match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => Some(rt),
                Err(fallback_err) => {
                    error!("failed to create any Tokio runtime ({fallback_err})");
                    None
                }
            }
        }
    }
}

async fn run(command: Command, config: LauncherConfig) -> Result<(), String> {
    let mut session = engine::start_session(&config).await;
    match command {
        Command::Status { watch, json } => show_status(&session, watch, json).await,
        Command::Check => check(&mut session).await,
        Command::Connect { name } => {
            session.handle.start_connect(name);
            wait_for_reply(&mut session).await
        }
        Command::Settings { name } => {
            session.handle.save_settings(name);
            wait_for_reply(&mut session).await
        }
        Command::News => show_news(&session),
    }
}

fn describe(status: &ServerStatus) -> String {
    if !status.online {
        return format!("offline ({})", status.hostname);
    }
    let lock = if status.passworded { " [password]" } else { "" };
    format!(
        "{} {}/{} players{lock}",
        status.hostname, status.players, status.max_players
    )
}

fn render(status: &ServerStatus, json: bool) -> String {
    if json && let Ok(text) = serde_json::to_string(status) {
        return text;
    }
    describe(status)
}

async fn show_status(session: &Session, watch: bool, json: bool) -> Result<(), String> {
    println!("{}", render(&session.handle.server_status(), json));
    if !watch {
        return Ok(());
    }
    let mut updates = session.handle.status_updates();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Err("status worker stopped".into());
                }
                let status = updates.borrow_and_update().clone();
                println!("{}", render(&status, json));
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{msg:12} {bar:40} {pos:>3}%")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

async fn check(session: &mut Session) -> Result<(), String> {
    session.handle.check_for_update();
    let bar = download_bar();
    loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Some(LauncherEvent::State(UpdateState::Idle)) => {}
                Some(LauncherEvent::State(state)) => {
                    bar.set_message(format!("{state:?}"));
                    if state == UpdateState::Downloading {
                        bar.set_position(0);
                    }
                }
                Some(LauncherEvent::Progress(percent)) => bar.set_position(percent.into()),
                Some(LauncherEvent::Outcome(outcome)) => {
                    bar.finish_and_clear();
                    if outcome.is_success() {
                        println!("{outcome}");
                        return Ok(());
                    }
                    return Err(outcome.to_string());
                }
                Some(LauncherEvent::Notice(notice)) => warn!("{notice}"),
                Some(_) => {}
                None => return Err("controller stopped".into()),
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; canceling download");
                session.handle.cancel_download();
            }
        }
    }
}

async fn wait_for_reply(session: &mut Session) -> Result<(), String> {
    while let Some(event) = session.events.recv().await {
        match event {
            LauncherEvent::SettingsSaved(name) => {
                println!("player name saved: {name}");
                return Ok(());
            }
            LauncherEvent::Launched { pid } => {
                println!("game started (pid {pid})");
                return Ok(());
            }
            LauncherEvent::Notice(notice) => return Err(notice.to_string()),
            _ => {}
        }
    }
    Err("controller stopped".into())
}

fn show_news(session: &Session) -> Result<(), String> {
    let manifest = session
        .manifest
        .as_ref()
        .ok_or_else(|| "release manifest unavailable".to_owned())?;
    println!("{} (release {})", session.product_name, manifest.version);
    if let Some(background) = &session.assets.background {
        println!("background: {}", background.display());
    }
    if let Some(icon) = &session.assets.icon {
        println!("icon: {}", icon.display());
    }
    for item in &manifest.news {
        println!();
        println!("{}  {}", item.date, item.title);
        if !item.content.is_empty() {
            println!("{}", item.content);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_resolve_into_config() {
        let cli = Cli::try_parse_from([
            "samp-launcher",
            "--manifest-url",
            "https://example.com/launcher.json",
            "--app-dir",
            "/tmp/samp",
            "check",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.manifest_url, "https://example.com/launcher.json");
        assert_eq!(config.layout.root(), std::path::Path::new("/tmp/samp"));
        assert_eq!(config.probe_timeout, Duration::from_millis(1500));
        assert_eq!(config.timeouts.connect, Duration::from_secs(10));
        assert_eq!(config.timeouts.read, Duration::from_secs(30));
        assert_eq!(config.status_interval, Duration::from_secs(15));
        assert_eq!(config.product_name, None);
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn connect_requires_a_name() {
        assert!(
            Cli::try_parse_from(["samp-launcher", "--manifest-url", "http://x", "connect"])
                .is_err()
        );
    }

    #[test]
    fn describes_offline_and_online_servers() {
        assert_eq!(
            describe(&ServerStatus::offline("timed out")),
            "offline (timed out)"
        );
        let status = ServerStatus {
            online: true,
            passworded: true,
            players: 12,
            max_players: 100,
            hostname: "Grove Street".into(),
        };
        assert_eq!(describe(&status), "Grove Street 12/100 players [password]");
    }

    #[test]
    fn status_renders_as_json_on_request() {
        let status = ServerStatus::offline("timed out");
        assert_eq!(render(&status, false), "offline (timed out)");
        let value: serde_json::Value = serde_json::from_str(&render(&status, true)).unwrap();
        assert_eq!(value["online"], false);
        assert_eq!(value["hostname"], "timed out");
        assert_eq!(value["max_players"], 0);
    }

    #[test]
    fn status_flags_parse() {
        let cli = Cli::try_parse_from([
            "samp-launcher",
            "--manifest-url",
            "http://x",
            "status",
            "--watch",
            "--json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Status {
                watch: true,
                json: true
            }
        ));
    }
}
