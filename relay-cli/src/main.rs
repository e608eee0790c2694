mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version)]
#[command(about = "Batched notifications and blocking approvals over a Telegram bot")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: <config dir>/relay/config.toml)
    #[arg(long, global = true)]
    config_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a notification
    ///
    /// Normal notifications are combined with others sent within the batch window;
    /// high-priority ones go out immediately.
    ///
    /// Examples:
    ///   relay notify "Build finished"
    ///   relay notify "Disk almost full" --priority high
    Notify {
        /// Notification text
        text: String,

        /// Message priority level (normal, high)
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Ask the operator to pick one option and wait for the answer
    ///
    /// Exits 0 when an option was chosen, 2 when the request timed out, was
    /// superseded or was cancelled.
    ///
    /// JSON Response Format (with --json):
    ///   {"outcome": "chosen", "choice": "Approve", "value": "approve", "timestamp": "..."}
    ///
    /// Examples:
    ///   relay approve "Deploy to production?" -o Approve -o Reject
    ///   relay approve "Which region?" -o "EU=eu-west-1" -o "US=us-east-1" --timeout 60 --json
    Approve {
        /// The question shown to the operator
        question: String,

        /// An option, as LABEL or LABEL=VALUE. Repeat for each button.
        #[arg(short = 'o', long = "option", required = true)]
        options: Vec<String>,

        /// Approval timeout in seconds, 1 to 86400 (default: from configuration)
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=86_400))]
        timeout: Option<u64>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show or initialize relay settings
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Notify { text, priority } => {
            handlers::handle_notify(text, priority, cli.config_file).await?;
        }
        Commands::Approve {
            question,
            options,
            timeout,
            json,
        } => {
            let code =
                handlers::handle_approve(question, options, timeout, json, cli.config_file).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Config { init } => {
            if init {
                handlers::handle_config_init(cli.config_file).await?;
            } else {
                handlers::handle_config_show(cli.config_file).await?;
            }
        }
    }

    Ok(())
}
