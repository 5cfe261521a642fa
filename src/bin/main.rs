use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use packetrusher_panel::patcher::{ConfigPatcher, StagedIdentity, YamlConfigPatcher};
use packetrusher_panel::request::RawCount;
use packetrusher_panel::schedule::plan_triggers;
use packetrusher_panel::types::{CountryCode, NetworkCode};
use packetrusher_panel::{
    BatchRequest, Msin, PanelConfig, RunMode, create_orchestrator, next_identifier,
};

#[derive(Parser)]
#[command(name = "packetrusher-panel")]
#[command(about = "Control panel for batches of PacketRusher UE sessions")]
struct Cli {
    /// Panel config file (defaults to the usual search path)
    #[arg(long, global = true, env = "PANEL_CONFIG")]
    config: Option<PathBuf>,
    /// PacketRusher executable, overriding the config file
    #[arg(long, global = true)]
    binary: Option<PathBuf>,
    /// Simulator config.yml, overriding the config file
    #[arg(long, global = true)]
    simulator_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control panel and its live log channel
    Serve {
        #[arg(short, long, default_value = "3000", env = "PANEL_PORT")]
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Run an immediate batch to completion and print its summary
    Run {
        #[arg(long)]
        mcc: String,
        #[arg(long)]
        mnc: String,
        /// First identifier of the batch (10 digits)
        #[arg(long)]
        base: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 1)]
        ues: u32,
        #[arg(long)]
        amf_ip: Option<String>,
    },
    /// Show the schedule and which entries would be armed now
    Schedule,
    /// Write one identifier into the simulator config
    Patch {
        msin: String,
        #[arg(long)]
        mcc: Option<String>,
        #[arg(long)]
        mnc: Option<String>,
    },
    /// Print the identifier `offset` positions after `base`
    NextId {
        base: String,
        #[arg(default_value_t = 1)]
        offset: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref())?)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            info!(
                "Starting control panel for {} (config {})",
                config.binary_path.display(),
                config.simulator_config_path().display()
            );
            let orchestrator = create_orchestrator(&config)?;
            packetrusher_panel::server::start_http(orchestrator, &format!("{bind}:{port}"))
                .await?;
        }
        Commands::Run {
            mcc,
            mnc,
            base,
            count,
            ues,
            amf_ip,
        } => {
            let request = BatchRequest {
                country_code: mcc,
                network_code: mnc,
                base_identifier: base,
                session_count: Some(RawCount::from(i64::from(count))),
                ues_per_session: Some(RawCount::from(i64::from(ues))),
                run_mode: RunMode::ImmediateBatch,
                amf_ip,
                ..Default::default()
            };

            let orchestrator = create_orchestrator(&config)?;
            let summary = orchestrator.run_batch(&request).await?;

            for session in &summary.sessions {
                println!(
                    "  #{:<4} {}  {}",
                    session.index,
                    session.identifier,
                    session.error.as_deref().unwrap_or("ok")
                );
            }
            println!("{}", summary.describe());
            if let Some(next) = &summary.next_identifier {
                println!("Next identifier: {next}");
            }
            if !summary.all_succeeded() {
                bail!("batch did not complete cleanly");
            }
        }
        Commands::Schedule => {
            let orchestrator = create_orchestrator(&config)?;
            println!("Source: {}", orchestrator.schedule_source());

            let entries = orchestrator.fetch_schedule().await?;
            let plan = plan_triggers(
                entries,
                Utc::now(),
                config.schedule.default_session_size.max(1),
                usize::MAX,
            );
            for past in &plan.discarded {
                println!(
                    "  past     {}  {}",
                    past.clock_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    past.label.as_deref().unwrap_or("-")
                );
            }
            for trigger in &plan.triggers {
                println!(
                    "  upcoming {}  {}  {} UE",
                    trigger.trigger_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    trigger.label.as_deref().unwrap_or("-"),
                    trigger.session_size
                );
            }
            println!(
                "{} upcoming, {} already past",
                plan.triggers.len(),
                plan.discarded.len()
            );
        }
        Commands::Patch { msin, mcc, mnc } => {
            let msin = Msin::parse(&msin).context("invalid identifier")?;
            let country = match mcc {
                Some(raw) => Some(CountryCode::parse(&raw).context("mcc must be 3 digits")?),
                None => None,
            };
            let network = match mnc {
                Some(raw) => Some(NetworkCode::parse(&raw).context("mnc must be 2 digits")?),
                None => None,
            };

            let patcher =
                YamlConfigPatcher::new(config.simulator_config_path(), config.endpoints.clone());
            let identity = StagedIdentity {
                country,
                network,
                ..StagedIdentity::msin_only(msin)
            };
            patcher.apply(&identity).await?;
            println!("Staged {} in {}", identity.msin, patcher.path().display());
        }
        Commands::NextId { base, offset } => {
            println!("{}", next_identifier(&base, offset)?);
        }
    }

    Ok(())
}

/// Panel and HTTP logs at info unless `RUST_LOG` says otherwise.
fn log_filter(rust_log: Option<&str>) -> Result<EnvFilter> {
    let filter = match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::new("info")
            .add_directive("packetrusher_panel=info".parse()?)
            .add_directive("tower_http=info".parse()?),
    };
    Ok(filter)
}

fn load_config(cli: &Cli) -> Result<PanelConfig> {
    let mut config = match &cli.config {
        Some(path) => PanelConfig::load_from(path)?,
        None => PanelConfig::load()?,
    };
    if let Some(binary) = &cli.binary {
        config.binary_path = binary.clone();
    }
    if let Some(path) = &cli.simulator_config {
        config.simulator_config = Some(path.clone());
    }
    Ok(config)
}
