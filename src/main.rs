//! knowsync - collaborative sync for git-backed knowledge directories
//!
//! Additive knowledge merges on its own; shared state goes to review

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use knowsync::commands;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "knowsync")]
#[command(author, version, about = "Collaborative sync for git-backed knowledge directories")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Knowledge repository
    #[arg(short, long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a knowledge repository and become its master
    Init {
        /// Your user name (also names your branch)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Join a cloned knowledge repository as collaborator
    Join {
        /// Your user name (also names your branch)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Merge main into your branch
    Pull,

    /// Commit local changes and reconcile them with main
    Push,

    /// Pull, then push
    Sync,

    /// Reconcile every collaborator branch into main (master)
    MergeAll,

    /// Delete collaborator branches already merged into main
    Prune,

    /// Show identity, role and pending local changes
    Status,

    /// List repository members
    Members,

    /// List review requests
    Reviews {
        /// Filter by author login
        #[arg(short, long)]
        author: Option<String>,

        /// Only your own reviews
        #[arg(long)]
        mine: bool,

        /// State: open, closed, all
        #[arg(short, long, default_value = "open")]
        state: String,
    },

    /// Reconcile on a timer until Ctrl-C
    Daemon,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let repo = cli.repo;

    match cli.command {
        Commands::Init { user } => {
            commands::init(&repo, user.as_deref()).await?;
        }
        Commands::Join { user } => {
            commands::join(&repo, user.as_deref()).await?;
        }
        Commands::Pull => {
            commands::pull(&repo).await?;
        }
        Commands::Push => {
            commands::push(&repo).await?;
        }
        Commands::Sync => {
            commands::sync(&repo).await?;
        }
        Commands::MergeAll => {
            commands::merge_all(&repo).await?;
        }
        Commands::Prune => {
            commands::prune(&repo).await?;
        }
        Commands::Status => {
            commands::status(&repo).await?;
        }
        Commands::Members => {
            commands::members(&repo)?;
        }
        Commands::Reviews {
            author,
            mine,
            state,
        } => {
            commands::reviews(&repo, author, &state, mine).await?;
        }
        Commands::Daemon => {
            commands::daemon(repo).await?;
        }
    }

    Ok(())
}
