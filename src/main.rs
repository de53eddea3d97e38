use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod bridge;
mod commands;
mod config;
mod exec;
mod notifications;
mod pipeline;
mod provision;
mod proxy;
mod retry;
mod sandbox;
mod templates;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(
    author,
    version,
    about = "Secure shell sessions and setup pipelines for network-restricted sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter burrow.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Bootstrap a sandbox: provision repositories, run setup, optionally attach
    Up {
        /// Use an existing sandbox instead of creating one
        #[arg(long)]
        sandbox: Option<String>,

        /// Only these repositories (repeatable)
        #[arg(long = "repo")]
        repos: Vec<String>,

        /// Open an interactive shell once setup succeeds
        #[arg(long)]
        attach: bool,

        /// Environment for the interactive shell, KEY=VALUE (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Keep a newly created sandbox running afterwards
        #[arg(long)]
        keep: bool,

        /// Continue with the next repository when one fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Run setup commands for local checkouts
    Setup {
        /// Only these repositories (repeatable)
        #[arg(long = "repo")]
        repos: Vec<String>,

        /// Continue with the next repository when one fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Open an interactive shell in a running sandbox
    Attach {
        /// Sandbox id or name
        #[arg(env = "BURROW_SANDBOX")]
        id: String,

        /// Directory to start in (defaults to the sandbox workdir)
        #[arg(long)]
        dir: Option<String>,

        /// Environment for the shell, KEY=VALUE (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,
    },

    /// Relay stdin/stdout over a WebSocket (used as the ssh ProxyCommand)
    Proxy {
        /// ws:// or wss:// URL of the relay
        url: String,
    },

    /// Manage sandboxes created by burrow
    Sandboxes {
        #[command(subcommand)]
        action: commands::sandboxes::SandboxAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the proxy's byte stream and the command output, so
    // logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("burrow=debug")
        } else {
            EnvFilter::new("burrow=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Up {
            sandbox,
            repos,
            attach,
            env,
            keep,
            continue_on_error,
        } => {
            commands::up::run(commands::up::UpOptions {
                sandbox,
                repos,
                attach,
                env,
                keep,
                continue_on_error,
            })
            .await?;
        }
        Commands::Setup {
            repos,
            continue_on_error,
        } => {
            commands::setup::run(repos, continue_on_error).await?;
        }
        Commands::Attach { id, dir, env } => {
            commands::attach::run(id, dir, env).await?;
        }
        Commands::Proxy { url } => {
            proxy::run(&url).await?;
        }
        Commands::Sandboxes { action } => {
            commands::sandboxes::run(action).await?;
        }
    }

    Ok(())
}
