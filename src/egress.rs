//! Egress: find finished jobs in the queue's terminal directories, deliver
//! their output as replies and retire them.
//!
//! Each job file moves through `Discovered → Validated → Delivered → Retired`.
//! Retiring renames the job file into its message directory and removes the
//! job link, so a retired job can never be found again. Anything that cannot
//! be validated is skipped and left in place for a later scan. Output that
//! was sent but could not be retired is remembered and only retired on the
//! next attempt, never sent twice by one process.

pub mod watcher;

use crate::config::{Config, Paths};
use crate::error::{Error, StoreError};
use crate::messaging::Messaging;
use crate::output;
use crate::store::{JobLink, MessageMeta, MessageStore};

use watcher::WatchEvent;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Result of reconciling one job file.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Output delivered in `chunks` replies (zero for empty output) and the
    /// job retired.
    Delivered { chunks: usize },
    Skipped(SkipReason),
    /// Delivery or retirement failed. The job file stays for a retry.
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already retired, or never there.
    JobFileMissing,
    /// No job link for this id, so no way to find the message.
    LinkMissing,
    /// Ingress has not committed the message yet.
    MetaMissing,
    MetaInvalid,
    /// Another reconcile of the same file is running.
    InFlight,
}

pub struct Reconciler<M> {
    messaging: Arc<M>,
    store: MessageStore,
    terminal_dirs: Vec<PathBuf>,
    rescan_interval: Duration,
    in_flight: Mutex<HashSet<String>>,
    /// Jobs whose replies went out but whose retirement failed, with the
    /// number of chunks sent.
    sent_unretired: Mutex<HashMap<String, usize>>,
}

impl<M: Messaging> Reconciler<M> {
    pub fn new(messaging: Arc<M>, store: MessageStore, paths: &Paths, config: &Config) -> Self {
        Self {
            messaging,
            store,
            terminal_dirs: vec![paths.done.clone(), paths.failed.clone()],
            rescan_interval: config.rescan_interval,
            in_flight: Mutex::new(HashSet::new()),
            sent_unretired: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile everything currently in the terminal directories, in file
    /// name order across all of them. A name present in both is visited in
    /// `done` first.
    pub async fn scan(&self) -> Vec<(String, ReconcileOutcome)> {
        let mut found: Vec<(String, &Path)> = Vec::new();
        for dir in &self.terminal_dirs {
            match list_job_files(dir).await {
                Ok(names) => found.extend(names.into_iter().map(|name| (name, dir.as_path()))),
                Err(error) => {
                    tracing::warn!(%error, dir = %dir.display(), "failed to list terminal directory");
                }
            }
        }
        found.sort_by(|left, right| left.0.cmp(&right.0));

        let mut outcomes = Vec::with_capacity(found.len());
        for (name, dir) in found {
            let outcome = self.reconcile(dir, &name).await;
            outcomes.push((name, outcome));
        }

        let delivered = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ReconcileOutcome::Delivered { .. }))
            .count();
        tracing::debug!(seen = outcomes.len(), delivered, "scan finished");

        outcomes
    }

    /// Reconcile the job file `name` inside terminal directory `dir`.
    pub async fn reconcile(&self, dir: &Path, name: &str) -> ReconcileOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, name) else {
            tracing::debug!(job_id = %name, "job already in flight");
            return ReconcileOutcome::Skipped(SkipReason::InFlight);
        };

        match self.deliver_and_retire(dir, name).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, job_id = %name, "failed to deliver job output");
                ReconcileOutcome::Failed(error)
            }
        }
    }

    async fn deliver_and_retire(&self, dir: &Path, name: &str) -> crate::Result<ReconcileOutcome> {
        let job_path = dir.join(name);
        if !exists(&job_path).await? {
            return Ok(skip(name, SkipReason::JobFileMissing));
        }

        let Ok(link) = self.store.job_link(name) else {
            return Ok(skip(name, SkipReason::LinkMissing));
        };
        let message_dir = match link.message_dir().await {
            Ok(message_dir) => message_dir,
            Err(error) if error.is_not_found() => return Ok(skip(name, SkipReason::LinkMissing)),
            Err(error) => return Err(error.into()),
        };
        let retired = message_dir.join(name);

        let already_sent = lock(&self.sent_unretired).get(name).copied();
        if let Some(chunks) = already_sent {
            tracing::info!(job_id = %name, "output already sent, retrying retirement");
            self.retire(&job_path, &retired, &link).await?;
            lock(&self.sent_unretired).remove(name);
            return Ok(ReconcileOutcome::Delivered { chunks });
        }

        let meta = match MessageMeta::read(&link.meta_path()).await {
            Ok(meta) => meta,
            Err(error) if error.is_not_found() => return Ok(skip(name, SkipReason::MetaMissing)),
            Err(StoreError::InvalidMeta { source, .. }) => {
                tracing::warn!(error = %source, job_id = %name, "job metadata is invalid");
                return Ok(skip(name, SkipReason::MetaInvalid));
            }
            Err(error) => return Err(error.into()),
        };

        let raw = match tokio::fs::read(&job_path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(skip(name, SkipReason::JobFileMissing));
            }
            Err(error) => return Err(StoreError::io("failed to read job file", &job_path, error).into()),
        };

        let chunks = output::render(
            &String::from_utf8_lossy(&raw),
            self.messaging.max_message_length(),
        );
        let target = meta.reply_target();

        if !chunks.is_empty() {
            if let Err(error) = self.messaging.send_typing(target.chat_id).await {
                tracing::debug!(%error, chat_id = target.chat_id, "failed to send typing indicator");
            }
            for chunk in &chunks {
                self.messaging.send_reply(target, chunk).await?;
            }
        }

        if let Err(error) = self.retire(&job_path, &retired, &link).await {
            lock(&self.sent_unretired).insert(name.to_string(), chunks.len());
            return Err(error.into());
        }

        tracing::info!(
            job_id = %name,
            chat_id = target.chat_id,
            message_id = target.message_id,
            chunks = chunks.len(),
            "job delivered"
        );

        Ok(ReconcileOutcome::Delivered {
            chunks: chunks.len(),
        })
    }

    /// Move the job file into its message directory, then drop the link.
    /// Once the file has moved the job is retired; a link that cannot be
    /// removed is only logged.
    async fn retire(&self, job_path: &Path, retired: &Path, link: &JobLink) -> Result<(), StoreError> {
        tokio::fs::rename(job_path, retired)
            .await
            .map_err(|error| StoreError::io("failed to retire job file", job_path, error))?;
        if let Err(error) = link.remove_if_symlink().await {
            tracing::warn!(%error, "failed to remove job link");
        }

        Ok(())
    }

    /// Scan once, then follow watcher events until shutdown. A full rescan
    /// runs every `rescan_interval` regardless, picking up jobs that finished
    /// before their message was committed and anything the watcher missed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (events_tx, mut events_rx) = mpsc::channel(64);

        // Watch before the startup scan so nothing finishing in between is missed.
        let (mut watching, watcher_thread) = match watcher::spawn(&self.terminal_dirs, events_tx) {
            Ok(handle) => (true, Some(handle)),
            Err(error) => {
                tracing::warn!(
                    %error,
                    interval_secs = self.rescan_interval.as_secs(),
                    "watcher unavailable, falling back to periodic rescan"
                );
                (false, None)
            }
        };

        self.scan().await;
        tracing::info!(watching, "egress running");

        let mut rescan = tokio::time::interval(self.rescan_interval);
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        rescan.reset();

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                event = events_rx.recv(), if watching => match event {
                    Some(WatchEvent::Batch(batch)) => {
                        for (dir, name) in batch {
                            if *shutdown.borrow() {
                                break;
                            }
                            self.reconcile(&dir, &name).await;
                        }
                    }
                    Some(WatchEvent::Degraded(reason)) => {
                        tracing::warn!(%reason, "watcher degraded, falling back to periodic rescan");
                        watching = false;
                        self.scan().await;
                    }
                    None => {
                        tracing::warn!("watcher stopped, falling back to periodic rescan");
                        watching = false;
                        self.scan().await;
                    }
                },
                _ = rescan.tick() => {
                    self.scan().await;
                }
            }
        }

        drop(events_rx);
        if let Some(thread) = watcher_thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("watcher thread panicked"),
                Err(error) => tracing::warn!(%error, "failed to join watcher thread"),
            }
        }

        tracing::info!("egress stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn skip(name: &str, reason: SkipReason) -> ReconcileOutcome {
    tracing::debug!(job_id = %name, ?reason, "job skipped");
    ReconcileOutcome::Skipped(reason)
}

async fn exists(path: &Path) -> Result<bool, StoreError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(StoreError::io("failed to stat", path, error)),
    }
}

/// Regular files in `dir`, sorted by name. A missing directory is empty.
async fn list_job_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(StoreError::io("failed to read directory", dir, error)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| StoreError::io("failed to read directory", dir, error))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

/// Membership in the in-flight set, released on drop.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, name: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());

        inserted.then(|| Self {
            set,
            name: name.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}
