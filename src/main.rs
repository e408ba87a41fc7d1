//! courier - deliver queued agent jobs back to the chat they came from.

use courier::config::{Config, Paths};
use courier::daemon;
use courier::dispatch::{self, DispatchArgs};
use courier::egress::Reconciler;
use courier::ingress::Enqueuer;
use courier::messaging::{Messaging as _, TelegramAdapter};
use courier::queue::NqQueue;
use courier::store::MessageStore;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// courier - chat to job queue bridge
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Instance home holding the message store, queue and logs
    #[arg(long, env = "COURIER_HOME", global = true)]
    home: Option<PathBuf>,

    /// Path to the config file (default: <home>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log to a daily rolling file under <home>/logs instead of the terminal
    #[arg(long, global = true)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run ingress and egress in one process
    Run,
    /// Receive chat messages and enqueue them as jobs
    Ingress,
    /// Deliver finished jobs back to the chat
    Egress,
    /// Run the agent for one prompt (invoked by the queue)
    Dispatch(DispatchArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(Config::default_instance_dir);
    let paths = Paths::new(&home);
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());

    let (with_ingress, with_egress) = match &cli.command {
        Command::Dispatch(args) => {
            daemon::init_dispatch_tracing();
            return match run_dispatch(args, &config_path, &paths).await {
                Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                Err(error) => {
                    eprintln!("courier dispatch: {error:#}");
                    ExitCode::from(1)
                }
            };
        }
        Command::Run => (true, true),
        Command::Ingress => (true, false),
        Command::Egress => (false, true),
    };

    if cli.log_to_file {
        if let Err(error) = daemon::init_file_tracing(&paths, cli.debug) {
            eprintln!("error: {error:#}");
            return ExitCode::FAILURE;
        }
    } else {
        daemon::init_foreground_tracing(cli.debug);
    }

    match run_service(with_ingress, with_egress, &config_path, &paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error:#}");
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_dispatch(
    args: &DispatchArgs,
    config_path: &std::path::Path,
    paths: &Paths,
) -> anyhow::Result<i32> {
    let config = Config::load(config_path).context("invalid configuration")?;
    Ok(dispatch::dispatch(args, &config, paths).await?)
}

async fn run_service(
    with_ingress: bool,
    with_egress: bool,
    config_path: &std::path::Path,
    paths: &Paths,
) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("invalid configuration")?;
    paths.ensure()?;

    tracing::info!(
        home = %paths.home.display(),
        allowed_users = config.allowed_users.len(),
        with_ingress,
        with_egress,
        "starting courier"
    );

    let shutdown = daemon::shutdown_on_signal()?;
    let messaging = Arc::new(TelegramAdapter::new(config.bot_token.clone()));
    let store = MessageStore::new(&paths.store);
    let reconciler = Reconciler::new(messaging.clone(), store.clone(), paths, &config);

    let ingress = async {
        if with_ingress {
            run_ingress(&messaging, &store, &config, paths, shutdown.clone())
                .await
                .inspect_err(|error| tracing::error!("ingress stopped: {error:#}"))
        } else {
            Ok(())
        }
    };
    let egress = async {
        if with_egress {
            reconciler.run(shutdown.clone()).await;
        }
    };
    let (ingress, ()) = tokio::join!(ingress, egress);

    if let Err(error) = messaging.shutdown().await {
        tracing::warn!(%error, "messaging shutdown failed");
    }
    ingress?;

    tracing::info!("courier stopped");
    Ok(())
}

async fn run_ingress(
    messaging: &Arc<TelegramAdapter>,
    store: &MessageStore,
    config: &Config,
    paths: &Paths,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let self_exe = std::env::current_exe().context("failed to locate own executable")?;
    let stream = messaging
        .start()
        .await
        .context("failed to start telegram adapter")?;

    let queue = NqQueue::new(config.queue_binary.clone(), paths);
    Enqueuer::new(messaging.clone(), queue, store.clone(), config, self_exe)
        .listen(stream, shutdown)
        .await;

    Ok(())
}
