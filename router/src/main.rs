//! GLM prompt-routing shim over the Claude CLI.
//!
//! Accepts prompts (one-shot via `route`, or line-oriented JSON via
//! `serve`), forwards them to the `claude` CLI with GLM credentials
//! injected into the child environment, and returns the captured result
//! with file-tracking and structured logging.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use router::core::sanitize::Sanitizer;
use router::core::types::{Model, RouteRequest};
use router::io::config::{self, Credentials, RouterConfig};
use router::io::log_pipeline::LogPipeline;
use router::logging;
use router::route::Router;
use router::serve;

#[derive(Parser)]
#[command(
    name = "router",
    version,
    about = "GLM prompt routing shim over the Claude CLI"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "router.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON requests from stdin (one per line) and write JSON replies.
    Serve,
    /// Route a single prompt and print the reply as pretty JSON.
    Route {
        /// Prompt text; read from stdin when omitted.
        #[arg(long)]
        prompt: Option<String>,
        /// Model identifier (glm-4.6 or glm-4.5-air).
        #[arg(long)]
        model: Option<String>,
    },
    /// Validate configuration and print the resolved, redacted settings.
    Check,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    match cli.command {
        Command::Serve => {
            let (pipeline, router) = start_router(config)?;
            let result = serve::serve(&router);
            pipeline.shutdown();
            result
        }
        Command::Route { prompt, model } => cmd_route(config, prompt, model),
        Command::Check => cmd_check(&cli.config, &config),
    }
}

fn start_router(config: RouterConfig) -> Result<(LogPipeline, Router)> {
    let creds = Credentials::from_env()?;
    let sanitizer = Sanitizer::new(Some(&creds.auth_token));
    let pipeline = LogPipeline::start(&config.logging, sanitizer);
    let router = Router::new(config, creds, pipeline.handle());
    Ok((pipeline, router))
}

fn cmd_route(config: RouterConfig, prompt: Option<String>, model: Option<String>) -> Result<()> {
    let model = match model {
        Some(name) => Some(Model::parse(&name).ok_or_else(|| {
            anyhow!("unknown model {name}; expected glm-4.6 or glm-4.5-air")
        })?),
        None => None,
    };
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read prompt from stdin")?;
            buf
        }
    };

    let (pipeline, router) = start_router(config)?;
    let reply = router.route(&RouteRequest { prompt, model });
    pipeline.shutdown();
    println!(
        "{}",
        serde_json::to_string_pretty(&reply).context("serialize reply")?
    );
    Ok(())
}

fn cmd_check(path: &Path, config: &RouterConfig) -> Result<()> {
    println!(
        "config file: {} ({})",
        path.display(),
        if path.exists() {
            "found"
        } else {
            "missing, using defaults"
        }
    );
    let rendered = toml::to_string_pretty(config).context("serialize config")?;
    println!("{rendered}");

    let creds = Credentials::from_env()?;
    println!("{} = {}", config::BASE_URL_VAR, creds.base_url);
    println!("{} = ***REDACTED***", config::AUTH_TOKEN_VAR);
    Ok(())
}
