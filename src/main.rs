use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use unsub_agent::brain::OpenAiGateway;
use unsub_agent::config::{AgentConfig, GatewayConfig, data_dir_or_cwd, default_asset_dir};
use unsub_agent::hands::ChromeDriver;
use unsub_agent::simulation::{self, Scoreboard};
use unsub_agent::transcript::{RunRecord, TrialRecord, load_json, save_json};
use unsub_agent::{AgentFailure, AgentStatus, Conversation, UnsubAgent, render};

const DEFAULT_SIM_EMAIL: &str = "annabelle.lee@gmail.com";

#[derive(Parser)]
#[command(
    name = "unsub",
    version,
    about = "Unsubscribe from mailing lists with an LLM-driven browser"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent against one unsubscribe link.
    Run {
        #[arg(long)]
        url: String,
        #[arg(long, env = "UNSUB_USER_EMAIL")]
        user_email: String,
        /// Where to write the run record (JSON).
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long)]
        headless: bool,
        #[arg(long, default_value_t = AgentConfig::default().max_turns)]
        max_turns: usize,
    },
    /// Run the agent against every saved email under a directory, one record per domain.
    RunMany {
        /// Contains `<id>/<name>.json` files with an `unsub_link.href` field.
        #[arg(long)]
        email_dir: PathBuf,
        #[arg(long, env = "UNSUB_USER_EMAIL")]
        user_email: String,
        #[arg(long)]
        log_path: PathBuf,
        #[arg(long)]
        headless: bool,
    },
    /// Score the agent against the simulated sites.
    Simulate {
        /// Run only this simulation (default: all of them).
        #[arg(long)]
        simulation: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_SIM_EMAIL)]
        user_email: String,
        #[arg(long, default_value_t = 4)]
        runs: usize,
        #[arg(long)]
        headless: bool,
        #[arg(long, env = "UNSUB_ASSET_DIR")]
        asset_dir: Option<PathBuf>,
    },
    /// Render a saved run or trial as a standalone HTML page.
    Render {
        path: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Run {
            url,
            user_email,
            log_path,
            headless,
            max_turns,
        } => {
            let log_path = log_path.unwrap_or_else(|| data_dir_or_cwd("runs").join("run.json"));
            let record = run_link(&url, None, &user_email, headless, max_turns, &cancel).await?;
            save_json(&log_path, &record)?;
            println!("{}", outcome_line(&record));
            println!("Record saved to {}", log_path.display());
        }
        Command::RunMany {
            email_dir,
            user_email,
            log_path,
            headless,
        } => run_many(&email_dir, &user_email, &log_path, headless, &cancel).await?,
        Command::Simulate {
            simulation,
            output_dir,
            user_email,
            runs,
            headless,
            asset_dir,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| data_dir_or_cwd("simulations"));
            let asset_dir = asset_dir.unwrap_or_else(default_asset_dir);
            let names: Vec<String> = match simulation {
                Some(name) => vec![name],
                None => simulation::names().map(str::to_string).collect(),
            };
            for name in names {
                let board = simulate(
                    &name,
                    &asset_dir,
                    &output_dir,
                    &user_email,
                    runs,
                    headless,
                    &cancel,
                )
                .await?;
                println!("{name}: SUMMARY: {}", board.summary());
            }
        }
        Command::Render { path, out } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let page = render::render_page(&raw)?;
            let out = out.unwrap_or_else(|| path.with_extension("html"));
            std::fs::write(&out, page)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Rendered {}", out.display());
        }
    }

    Ok(())
}

async fn launch_driver(headless: bool) -> Result<ChromeDriver> {
    let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(headless))
        .await
        .map_err(|e| anyhow::anyhow!("Browser launch panicked: {}", e))??;
    Ok(driver)
}

/// One agent run with its own browser. Returns the final status or the fatal
/// error, with whatever conversation was collected.
async fn run_agent(
    url: &str,
    user_email: &str,
    headless: bool,
    config: AgentConfig,
    cancel: &CancellationToken,
) -> Result<Result<(AgentStatus, Conversation), AgentFailure>> {
    let gateway = OpenAiGateway::new(GatewayConfig::from_env()?, cancel.clone());
    let driver = launch_driver(headless).await?;
    let max_turns = config.max_turns;
    let agent = UnsubAgent::new(&gateway, &driver, config).with_cancel(cancel.clone());

    let outcome = agent.run(url, user_email, max_turns).await;
    tokio::task::spawn_blocking(move || drop(driver)).await?;
    Ok(outcome)
}

async fn run_link(
    url: &str,
    domain: Option<String>,
    user_email: &str,
    headless: bool,
    max_turns: usize,
    cancel: &CancellationToken,
) -> Result<RunRecord> {
    let config = AgentConfig {
        max_turns,
        ..AgentConfig::default()
    };
    let mut record = RunRecord {
        url: url.to_string(),
        domain,
        user_email: user_email.to_string(),
        ..RunRecord::default()
    };
    match run_agent(url, user_email, headless, config, cancel).await? {
        Ok((status, conversation)) => {
            record.status = Some(status);
            record.conversation = Some(conversation);
        }
        Err(failure) => {
            record.error = Some(failure.source.to_string());
            if !failure.conversation.is_empty() {
                record.conversation = Some(failure.conversation);
            }
        }
    }
    Ok(record)
}

fn outcome_line(record: &RunRecord) -> String {
    match (&record.status, &record.error) {
        (Some(status), _) => format!("{}: {status}", record.url),
        (None, Some(error)) => format!("{}: error: {error}", record.url),
        (None, None) => format!("{}: no outcome", record.url),
    }
}

#[derive(Deserialize)]
struct SavedEmail {
    unsub_link: Option<UnsubLink>,
}

#[derive(Deserialize)]
struct UnsubLink {
    href: String,
}

/// `(domain, link)` for every saved email that carries an unsubscribe link.
fn collect_links(email_dir: &Path) -> Result<Vec<(String, String)>> {
    let mut links = Vec::new();
    let mut email_dirs: Vec<PathBuf> = std::fs::read_dir(email_dir)
        .with_context(|| format!("Failed to read {}", email_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    email_dirs.sort();

    for dir in email_dirs {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        for file in files {
            let email: SavedEmail = match load_json(&file) {
                Ok(email) => email,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "skipping unreadable email");
                    continue;
                }
            };
            let Some(link) = email.unsub_link else { continue };
            match url::Url::parse(&link.href).ok().and_then(|u| u.host_str().map(str::to_string)) {
                Some(domain) => links.push((domain, link.href)),
                None => tracing::warn!(href = %link.href, "skipping link without a host"),
            }
        }
    }
    Ok(links)
}

async fn run_many(
    email_dir: &Path,
    user_email: &str,
    log_path: &Path,
    headless: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let links = collect_links(email_dir)?;
    tracing::info!(links = links.len(), "collected unsubscribe links");

    for (domain, href) in links {
        if cancel.is_cancelled() {
            bail!("cancelled");
        }
        let record_path = log_path.join(format!("{domain}.json"));
        if record_path.exists() {
            tracing::info!(%domain, "record exists, skipping");
            continue;
        }
        let record = run_link(
            &href,
            Some(domain.clone()),
            user_email,
            headless,
            AgentConfig::default().max_turns,
            cancel,
        )
        .await?;
        save_json(&record_path, &record)?;
        println!("{}", outcome_line(&record));
    }
    Ok(())
}

async fn simulate(
    name: &str,
    asset_dir: &Path,
    output_dir: &Path,
    user_email: &str,
    runs: usize,
    headless: bool,
    cancel: &CancellationToken,
) -> Result<Scoreboard> {
    let mut board = Scoreboard::default();
    for i in 0..runs {
        if cancel.is_cancelled() {
            bail!("cancelled");
        }
        let Some(sim) = simulation::build(name) else {
            bail!(
                "Unknown simulation '{}'. Known: {}",
                name,
                simulation::names().collect::<Vec<_>>().join(", ")
            );
        };
        let mut sim = sim.with_asset_dir(asset_dir);
        let url = sim.start()?;

        let outcome = run_agent(&url, user_email, headless, AgentConfig::default(), cancel).await;
        let sim_status = tokio::task::spawn_blocking(move || sim.finish()).await?;

        let (agent_status, conversation) = match outcome? {
            Ok(done) => done,
            Err(failure) => {
                tracing::error!(
                    simulation = name,
                    trial = i,
                    error = %failure.source,
                    "trial aborted"
                );
                (AgentStatus::Failure, failure.conversation)
            }
        };
        board.record(agent_status, sim_status);
        tracing::info!(simulation = name, trial = i, %agent_status, %sim_status, "trial done");

        let trial = TrialRecord {
            agent_status,
            sim_status,
            conversation,
        };
        save_json(&output_dir.join(name).join(format!("trial_{i}.json")), &trial)?;
    }
    Ok(board)
}
