//! Grove CLI - read, write and watch trees in a remote git repository.

use clap::{Parser, Subcommand};
use grove_client::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod settings;

/// Grove - work with a remote git repository without a working copy
#[derive(Parser, Debug)]
#[command(name = "grove")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (TOML or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Remote repository URL or path
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Author name for new commits
    #[arg(long = "author", global = true)]
    author_name: Option<String>,

    /// Author email for new commits
    #[arg(long = "email", global = true)]
    author_email: Option<String>,

    /// Download blob content along with trees
    #[arg(long, global = true)]
    full_fetch: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every ref
    Refs,

    /// List branches
    Branches,

    /// List tags
    Tags,

    /// List the files of a commit
    Tree {
        /// Commit hash
        commit: String,
    },

    /// Print an object's content
    Cat {
        /// Object hash
        hash: String,
    },

    /// Print a commit's message
    LogMessage {
        /// Commit hash
        commit: String,
    },

    /// Commit changes on top of a branch and push
    Push {
        /// Branch or full ref name
        reference: String,
        /// Write a local file into the tree (PATH=FILE)
        #[arg(short, long = "write", value_name = "PATH=FILE")]
        writes: Vec<String>,
        /// Delete a path and everything below it
        #[arg(short, long = "delete", value_name = "PATH")]
        deletes: Vec<String>,
        /// Commit message
        #[arg(short, long)]
        message: String,
    },

    /// Create a branch
    Branch {
        /// New branch name
        name: String,
        /// Commit, ref or branch to start from; omit for an orphan branch
        #[arg(short, long)]
        from: Option<String>,
        /// Message of the orphan commit
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Print a ref's value whenever it changes
    Watch {
        /// Branch or full ref name
        reference: String,
        /// Polling interval in seconds
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },
}

fn init_tracing(verbose: u8, json: bool) {
    let log_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("grove={log_level}").into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let overrides = settings::Overrides {
        endpoint: cli.endpoint,
        name: cli.author_name,
        email: cli.author_email,
        full_fetch: cli.full_fetch,
    };
    let config = settings::load(cli.config.as_deref(), &overrides)?;
    let mut client = Client::new(config)?;
    let out = &mut std::io::stdout().lock();

    match cli.command {
        Commands::Refs => commands::refs(&mut client, &cancel, out).await,
        Commands::Branches => commands::branches(&mut client, &cancel, out).await,
        Commands::Tags => commands::tags(&mut client, &cancel, out).await,
        Commands::Tree { commit } => commands::tree(&mut client, &commit, &cancel, out).await,
        Commands::Cat { hash } => commands::cat(&mut client, &hash, &cancel, out).await,
        Commands::LogMessage { commit } => {
            commands::log_message(&mut client, &commit, &cancel, out).await
        }
        Commands::Push {
            reference,
            writes,
            deletes,
            message,
        } => {
            let changes = commands::collect_changes(&writes, &deletes).await?;
            commands::push(&mut client, &reference, &changes, &message, &cancel, out).await
        }
        Commands::Branch {
            name,
            from,
            message,
        } => commands::branch(&mut client, &name, from.as_deref(), &message, &cancel, out).await,
        Commands::Watch {
            reference,
            interval,
        } => {
            let interval = Duration::from_secs(interval);
            commands::watch(&mut client, &reference, interval, &cancel, out).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupted");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
