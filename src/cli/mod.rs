//! CLI commands for copilot-hub using clap.

pub mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{get_settings_path, load_settings_from, save_settings_to, Settings};
use crate::core::chunking::{make_batches, BatchMode};
use crate::core::traffic::{OrchestrateOptions, OrchestrateOutcome};
use crate::core::SubmitOutcome;
use crate::hub::Hub;
use crate::participant::ParticipantRegistry;

use demo::{ConsoleSink, EchoAgent, Operator};

/// copilot-hub - shared conversations and paced exchanges between copilots.
#[derive(Parser)]
#[command(name = "copilot-hub")]
#[command(version = "0.1.0")]
#[command(about = "copilot-hub - turn-taking and traffic control for copilots", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Link an operator with echo copilots and run a conversation
    Demo {
        /// Number of copilots to link
        #[arg(short, long, default_value_t = 2)]
        agents: usize,

        /// Message the operator submits
        #[arg(short, long, default_value = "Hej")]
        message: String,

        /// Simulated reply latency in milliseconds
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,

        /// Also pace this file from copilot1 to copilot2
        #[arg(long)]
        pace: Option<PathBuf>,
    },

    /// Show how a file would be split into batches
    Batches {
        /// File to split
        file: PathBuf,

        /// Lines per batch (defaults to the configured size)
        #[arg(short, long)]
        size: Option<usize>,

        /// Batch mode: lines or numbered
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Show or initialize settings
    Config {
        /// Write default settings if none exist
        #[arg(long)]
        init: bool,

        /// Settings file to use instead of ~/.copilot-hub/settings.json
        #[arg(long, env = "COPILOT_HUB_SETTINGS")]
        path: Option<PathBuf>,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self, settings: Settings) -> Result<()> {
        match &self.command {
            Command::Demo {
                agents,
                message,
                delay_ms,
                pace,
            } => cmd_demo(settings, *agents, message, *delay_ms, pace.as_deref()).await,
            Command::Batches { file, size, mode } => {
                cmd_batches(&settings, file, *size, mode.as_deref())
            }
            Command::Config { init, path } => cmd_config(*init, path.clone()),
        }
    }
}

// Command implementations

async fn cmd_demo(
    settings: Settings,
    agents: usize,
    message: &str,
    delay_ms: u64,
    pace: Option<&std::path::Path>,
) -> Result<()> {
    if agents == 0 {
        anyhow::bail!("The demo needs at least one copilot");
    }

    let registry = Arc::new(ParticipantRegistry::new());
    registry.register(Arc::new(Operator::new("user")));
    let delay = Duration::from_millis(delay_ms);
    let ids: Vec<String> = (1..=agents).map(|i| format!("copilot{}", i)).collect();
    for id in &ids {
        registry.register(Arc::new(EchoAgent::new(id, delay)));
    }

    let hub = Hub::new(registry, Arc::new(ConsoleSink), settings);
    let mut conversation_id = String::new();
    for id in &ids {
        conversation_id = hub.link("user", id);
    }
    println!("Conversation {} with {} member(s)", conversation_id, agents + 1);

    match hub.submit(&conversation_id, "user", message).await {
        SubmitOutcome::Drained(report) => {
            println!("Drained {} round(s), stopped: {:?}", report.rounds.len(), report.stop)
        }
        other => println!("Submit: {:?}", other),
    }

    if let Some(path) = pace {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let to = ids.get(1).context("Pacing needs at least two copilots")?;
        match hub
            .orchestrate(&ids[0], to, &text, &OrchestrateOptions::default())
            .await
        {
            OrchestrateOutcome::Drained(report) => println!(
                "Route {}: {} batch(es) released, {} queued, stopped: {}",
                report.key, report.delivered, report.remaining, report.stop
            ),
            other => println!("Orchestrate: {:?}", other),
        }
    }

    if let Some(conversation) = hub.conversation(&conversation_id) {
        println!("\nTranscript:");
        println!("{}", serde_json::to_string_pretty(&conversation.history)?);
    }
    println!("\n{}", hub.stats());
    Ok(())
}

fn parse_batch_mode(mode: &str) -> Result<BatchMode> {
    match mode {
        "lines" => Ok(BatchMode::Lines),
        "numbered" => Ok(BatchMode::Numbered),
        other => anyhow::bail!("Unknown batch mode '{}'. Use 'lines' or 'numbered'.", other),
    }
}

fn cmd_batches(
    settings: &Settings,
    file: &std::path::Path,
    size: Option<usize>,
    mode: Option<&str>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = size.unwrap_or(settings.traffic.line_batch_size);
    let mode = match mode {
        Some(m) => parse_batch_mode(m)?,
        None => settings.traffic.batch_mode,
    };

    let batches = make_batches(&text, size, mode);
    println!("{} batch(es) ({:?}, size {}):", batches.len(), mode, size.max(1));
    for (i, batch) in batches.iter().enumerate() {
        println!("--- batch {} ---", i + 1);
        println!("{}", batch);
    }
    Ok(())
}

fn cmd_config(init: bool, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => get_settings_path()?,
    };

    if init {
        if path.exists() {
            println!("Settings already exist at {}", path.display());
        } else {
            save_settings_to(&path, &Settings::default())?;
            println!("Wrote default settings to {}", path.display());
        }
    }

    let settings = if path.exists() {
        load_settings_from(&path)?
    } else {
        println!("No settings file at {}, showing defaults", path.display());
        Settings::default()
    };
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
