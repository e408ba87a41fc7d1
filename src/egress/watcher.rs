//! Filesystem watcher for the queue's terminal directories.
//!
//! Linux only. A dedicated thread reads inotify and forwards each read as
//! one batch over a tokio channel. The thread exits once the receiving end
//! is dropped. On other platforms `spawn` fails and the reconciler rescans
//! periodically instead.

use std::path::PathBuf;
use tokio::sync::mpsc;

/// How long the watcher thread sleeps when no events are pending.
#[cfg(target_os = "linux")]
const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// What the watcher thread reports.
#[derive(Debug)]
pub enum WatchEvent {
    /// Files that finished appearing, as `(directory, file name)` in the
    /// order the kernel reported them.
    Batch(Vec<(PathBuf, String)>),
    /// The watcher stopped. Events may have been lost.
    Degraded(String),
}

/// Watch `dirs` for files that are closed after writing or moved in. The
/// thread stops when `events_tx`'s receiver is dropped.
#[cfg(target_os = "linux")]
pub fn spawn(
    dirs: &[PathBuf],
    events_tx: mpsc::Sender<WatchEvent>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    use anyhow::Context as _;
    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
        .context("inotify init failed")?;
    let mut watches = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let descriptor = inotify
            .add_watch(
                dir.as_path(),
                AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO,
            )
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        watches.push((descriptor, dir.clone()));
    }

    let handle = std::thread::Builder::new()
        .name("courier-watcher".into())
        .spawn(move || {
            loop {
                if events_tx.is_closed() {
                    return;
                }
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(Errno::EAGAIN) => {
                        std::thread::sleep(IDLE_POLL);
                        continue;
                    }
                    Err(error) => {
                        let _ = events_tx
                            .blocking_send(WatchEvent::Degraded(format!("inotify read failed: {error}")));
                        return;
                    }
                };

                let mut batch = Vec::new();
                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        let _ = events_tx.blocking_send(WatchEvent::Degraded(
                            "inotify queue overflow".to_string(),
                        ));
                        return;
                    }
                    if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                        continue;
                    }
                    let Some(dir) = watches
                        .iter()
                        .find(|(descriptor, _)| *descriptor == event.wd)
                        .map(|(_, dir)| dir)
                    else {
                        continue;
                    };
                    let Some(name) = event.name.and_then(|name| name.into_string().ok()) else {
                        continue;
                    };
                    batch.push((dir.clone(), name));
                }

                if !batch.is_empty() && events_tx.blocking_send(WatchEvent::Batch(batch)).is_err() {
                    // receiver gone, reconciler has shut down
                    return;
                }
            }
        })
        .context("failed to spawn watcher thread")?;

    Ok(handle)
}

#[cfg(not(target_os = "linux"))]
pub fn spawn(
    _dirs: &[PathBuf],
    _events_tx: mpsc::Sender<WatchEvent>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    anyhow::bail!("filesystem watcher unavailable on this platform")
}
