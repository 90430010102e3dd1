mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(
    about = "Gavel CLI - Evaluate submissions and manage language toolchains",
    long_about = None
)]
struct Cli {
    /// Path to languages.json (defaults to config/languages.json, then built-ins)
    #[arg(long, global = true)]
    languages: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a source file against a JSON test-case file
    Run {
        /// Language id (e.g. python, cpp, java)
        #[arg(short, long)]
        lang: String,

        /// Source file to evaluate
        #[arg(short, long)]
        source: PathBuf,

        /// JSON file holding an array of test cases
        #[arg(short, long)]
        tests: PathBuf,

        /// Entry point (class name for JVM languages)
        #[arg(short, long)]
        entry: Option<String>,

        /// Sandbox backend: process or docker
        #[arg(long, default_value = "process")]
        sandbox: String,

        /// Print the raw result JSON instead of the report
        #[arg(long, default_value = "false")]
        json: bool,

        /// Print Prometheus metrics after the run
        #[arg(long, default_value = "false")]
        metrics: bool,
    },

    /// List configured languages
    Langs,

    /// Write a default config/languages.json
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing languages.json
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            lang,
            source,
            tests,
            entry,
            sandbox,
            json,
            metrics,
        } => {
            let options = commands::RunOptions {
                languages: cli.languages,
                lang,
                source,
                tests,
                entry,
                sandbox,
                json,
                metrics,
            };
            let passed = commands::run(options).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Langs => {
            commands::list_languages(cli.languages.as_deref())?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
    }

    Ok(())
}
