//! Process plumbing: tracing setup and shutdown signalling.

use crate::config::Paths;

use tokio::sync::watch;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Longest `message` field written to the log before it is cut.
const MAX_MESSAGE_CHARS: usize = 280;

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Field formatter that cuts long `message` fields. Job output and prompts
/// can be megabytes.
fn field_formatter()
-> impl for<'writer> tracing_subscriber::fmt::FormatFields<'writer> + Send + Sync + 'static {
    format::debug_fn(|writer, field, value| {
        let field_name = field.name();

        if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            if was_truncated {
                write!(writer, "{field_name}={truncated}...")
            } else {
                write!(writer, "{field_name}={formatted}")
            }
        } else {
            write!(writer, "{field_name}={value:?}")
        }
    })
}

/// Initialize tracing for a process attached to a terminal.
pub fn init_foreground_tracing(debug: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_formatter())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

/// Initialize tracing into a daily rolling file under the instance log
/// directory, for running under a supervisor.
pub fn init_file_tracing(paths: &Paths, debug: bool) -> anyhow::Result<()> {
    use anyhow::Context as _;

    std::fs::create_dir_all(&paths.log_dir).with_context(|| {
        format!("failed to create log directory: {}", paths.log_dir.display())
    })?;

    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "courier.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer has to outlive every log call, so the guard lives until exit.
    std::mem::forget(guard);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_formatter())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Initialize tracing for `dispatch`. Stdout belongs to the agent and ends up
/// in the job file, so only warnings and errors go to stderr.
pub fn init_dispatch_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("warn"))
        .with(fmt_layer)
        .init();
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

/// Spawn a task that flips the returned receiver to `true` on Ctrl-C or
/// SIGTERM.
pub fn shutdown_on_signal() -> anyhow::Result<watch::Receiver<bool>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    #[cfg(unix)]
    let mut sigterm = {
        use anyhow::Context as _;
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
    };

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            sigterm.recv().await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        tokio::pin!(terminate);

        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("received ctrl-c, shutting down"),
                Err(error) => {
                    tracing::warn!(%error, "failed to listen for ctrl-c");
                    (&mut terminate).await;
                    tracing::info!("received SIGTERM, shutting down");
                }
            },
            _ = &mut terminate => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    Ok(shutdown_rx)
}
