use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use std::path::PathBuf;

use remedy::classify::{normalize_message, ErrorClassification};
use remedy::logging::{init_logging, LoggingConfig};
use remedy::{ErrorCategory, ErrorClassifier, ErrorKind, Fault, RecoveryConfig};

#[derive(Parser)]
#[command(name = "remedy")]
#[command(author, version, about = "Inspect how faults are classified and recovered")]
#[command(after_help = "Examples:
  remedy classify \"Connection refused\"
  remedy classify --kind PermissionError --json \"Permission denied\"
  remedy signature \"request 42af... to 10.0.0.1:443 timed out\"
  remedy config --file recovery.toml
  remedy backoff --category llm")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a fault message
    Classify {
        /// Fault kind, e.g. ConnectionError, Timeout, PermissionError
        #[arg(short, long, default_value = "RuntimeError")]
        kind: String,

        /// HTTP status attached to the fault
        #[arg(short, long)]
        status: Option<u16>,

        /// Subsystem tag attached to the fault
        #[arg(long)]
        subsystem: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        message: String,
    },
    /// Show the normalized message and signature key of a fault
    Signature {
        #[arg(short, long, default_value = "RuntimeError")]
        kind: String,

        message: String,
    },
    /// Validate a config file and print the effective configuration
    Config {
        /// TOML config file (defaults plus REMEDY__* overrides when omitted)
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Print the retry backoff schedule, before jitter
    Backoff {
        /// Error category whose retry settings to use
        #[arg(short, long, default_value = "network")]
        category: String,

        /// Number of attempts to show (default: the category's max_retries)
        #[arg(short = 'n', long)]
        attempts: Option<u32>,

        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SignatureReport {
    normalized: String,
    signature: String,
    category: ErrorCategory,
}

fn build_fault(kind: &str, message: &str, status: Option<u16>, subsystem: Option<&str>) -> Fault {
    let mut fault = Fault::new(ErrorKind::parse(kind), message);
    if let Some(status) = status {
        fault = fault.with_http_status(status);
    }
    if let Some(subsystem) = subsystem {
        fault = fault.with_subsystem(subsystem);
    }
    fault
}

fn load_config(file: Option<&PathBuf>) -> Result<RecoveryConfig> {
    match file {
        Some(path) => RecoveryConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => RecoveryConfig::from_env().context("Failed to load config from environment"),
    }
}

fn print_classification(c: &ErrorClassification) {
    let tier = c.suggested_tier.to_string();
    let tier = if c.is_retriable { tier.green() } else { tier.yellow() };
    println!("  {}   {}", "Category:".blue(), c.category.to_string().bold());
    println!("  {}   {}", "Severity:".blue(), c.severity);
    println!("  {}       {}", "Tier:".blue(), tier);
    println!("  {}       {}", "Code:".blue(), c.error_code);
    println!("  {}  {}", "Retriable:".blue(), c.is_retriable);
    if c.requires_state_reset {
        println!("  {}", "Requires workflow state reset".yellow());
    }
    if c.requires_resource_cleanup {
        println!("  {}", "Requires resource cleanup".yellow());
    }
    if !c.matched_patterns.is_empty() {
        println!("  {}", "Matched:".blue());
        for pattern in &c.matched_patterns {
            println!("    {}", pattern.dimmed());
        }
    }
    if !c.remediation_hints.is_empty() {
        println!("  {}      {}", "Hints:".blue(), c.remediation_hints.join(", "));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Classify {
            kind,
            status,
            subsystem,
            json,
            message,
        } => {
            let fault = build_fault(&kind, &message, status, subsystem.as_deref());
            let classification = ErrorClassifier::new().classify(&fault, None);
            if json {
                println!("{}", serde_json::to_string_pretty(&classification)?);
            } else {
                print_classification(&classification);
            }
        }
        Commands::Signature { kind, message } => {
            let fault = build_fault(&kind, &message, None, None);
            let classifier = ErrorClassifier::new();
            let classification = classifier.classify(&fault, None);
            let report = SignatureReport {
                normalized: normalize_message(&message),
                signature: classifier.signature(&fault, &classification).to_key(),
                category: classification.category,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config { file } => {
            let config = load_config(file.as_ref())?;
            eprintln!("{} configuration is valid", "✓".green());
            print!("{}", config.to_toml_string()?);
        }
        Commands::Backoff {
            category,
            attempts,
            file,
        } => {
            let category: ErrorCategory = category.parse().map_err(anyhow::Error::msg)?;
            let config = load_config(file.as_ref())?;
            let policy = config.retry.policy(category);
            let count = attempts.unwrap_or_else(|| policy.max_retries());

            println!(
                "{} {} (base {}, max {}s, jitter {})",
                "Backoff for".blue(),
                category.to_string().bold(),
                policy.config().exponential_base,
                policy.config().max_delay_seconds,
                if policy.config().jitter {
                    format!("±{}%", policy.config().jitter_percent)
                } else {
                    "off".to_string()
                }
            );
            for attempt in 0..count {
                println!(
                    "  attempt {:>2}: {:>8.3}s",
                    attempt + 1,
                    policy.base_delay(attempt).as_secs_f64()
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(
        LoggingConfig::from_verbosity(cli.verbose)
            .with_timestamps(false)
            .with_target(false),
    );
    run(cli)
}
