//! cypherloom CLI, the main entry point.
//!
//! Commands:
//! - `init`    print a default config file
//! - `plan`    show the intent and Cypher for a question without running it
//! - `query`   answer a question against the configured graph
//! - `config`  show the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "cypherloom",
    about = "cypherloom: ask a graph database questions in plain English",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of ~/.cypherloom/config.toml
    #[arg(short, long, global = true, env = "CYPHERLOOM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a default configuration file
    Init,

    /// Classify a question and show the query it would run
    Plan {
        /// The question, in plain English
        text: String,
    },

    /// Answer a question against the configured graph
    Query {
        /// The question, in plain English
        text: String,

        /// Run in write mode (never served from the result cache)
        #[arg(long)]
        write: bool,

        /// Do not add learned filters
        #[arg(long)]
        no_enhance: bool,
    },

    /// Show the effective configuration, secrets redacted
    Config,
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init => commands::init::run(),
        Commands::Plan { text } => commands::plan::run(config_path, &text),
        Commands::Query {
            text,
            write,
            no_enhance,
        } => commands::query::run(config_path, &text, write, !no_enhance).await,
        Commands::Config => commands::config_cmd::show(config_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_query_flags() {
        let cli = Cli::try_parse_from([
            "cypherloom",
            "--config",
            "/tmp/c.toml",
            "query",
            "List all vendors",
            "--write",
            "--no-enhance",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        match cli.command {
            Commands::Query {
                text,
                write,
                no_enhance,
            } => {
                assert_eq!(text, "List all vendors");
                assert!(write);
                assert!(no_enhance);
            }
            _ => panic!("Expected query command"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cypherloom", "plan", "Count controls", "-v", "--json-logs"])
            .unwrap();
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Plan { .. }));
    }

    #[test]
    fn query_requires_text() {
        assert!(Cli::try_parse_from(["cypherloom", "query"]).is_err());
    }
}
