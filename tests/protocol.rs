//! End-to-end: ingress persists and enqueues, a simulated executor runs the
//! stored prompt and drops a job file into a terminal directory, egress
//! delivers and retires it.

#![cfg(unix)]

use courier::config::{Config, Paths};
use courier::dispatch::{self, PromptSource};
use courier::egress::{ReconcileOutcome, Reconciler, SkipReason};
use courier::error::QueueError;
use courier::ingress::{Enqueuer, IngressOutcome, Rejection};
use courier::messaging::MemoryAdapter;
use courier::queue::JobQueue;
use courier::store::MessageStore;
use courier::{AttachmentRef, InboundMessage, MessageKind, ReplyTarget};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Queue double: accepts every job and remembers its argv.
#[derive(Default)]
struct SimulatedQueue {
    jobs: Mutex<Vec<(String, Vec<String>)>>,
}

impl SimulatedQueue {
    fn jobs(&self) -> Vec<(String, Vec<String>)> {
        self.jobs.lock().unwrap().clone()
    }
}

/// Local handle so the queue double can be shared with the harness
/// (the orphan rule forbids implementing `JobQueue` for `Arc<_>` here).
#[derive(Clone)]
struct SharedQueue(Arc<SimulatedQueue>);

impl JobQueue for SharedQueue {
    async fn submit(&self, argv: &[String]) -> Result<String, QueueError> {
        let mut jobs = self.0.jobs.lock().unwrap();
        let job_id = format!(",{:04}.{}", jobs.len() + 1, 4000 + jobs.len());
        jobs.push((job_id.clone(), argv.to_vec()));
        Ok(job_id)
    }
}

struct Harness {
    _temp_dir: tempfile::TempDir,
    paths: Paths,
    store: MessageStore,
    messaging: Arc<MemoryAdapter>,
    queue: Arc<SimulatedQueue>,
    enqueuer: Enqueuer<MemoryAdapter, SharedQueue>,
    reconciler: Reconciler<MemoryAdapter>,
}

const SENDER: i64 = 42;
const CHAT: i64 = -1001;

fn harness() -> Harness {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let paths = Paths::new(temp_dir.path());
    paths.ensure().expect("failed to create directories");

    let config = Config::from_json(
        &format!(r#"{{"bot_token": "token", "allowed_users": [{SENDER}]}}"#),
        &paths.config_file(),
    )
    .expect("config should parse");

    let store = MessageStore::new(&paths.store);
    let messaging = Arc::new(MemoryAdapter::default());
    let queue = Arc::new(SimulatedQueue::default());
    let enqueuer = Enqueuer::new(
        messaging.clone(),
        SharedQueue(queue.clone()),
        store.clone(),
        &config,
        PathBuf::from("/opt/courier/bin/courier"),
    );
    let reconciler = Reconciler::new(messaging.clone(), store.clone(), &paths, &config);

    Harness {
        _temp_dir: temp_dir,
        paths,
        store,
        messaging,
        queue,
        enqueuer,
        reconciler,
    }
}

fn message(message_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: Some(CHAT),
        message_id: Some(message_id),
        sender_id: Some(SENDER),
        text: Some(text.to_string()),
        kind: MessageKind::Text,
        reply_to_text: None,
    }
}

impl Harness {
    /// Play the executor for every queued job: resolve the prompt the way
    /// `dispatch --id` does and write framed output into `terminal_dir`.
    async fn execute_all(&self, terminal_dir: &Path, agent: impl Fn(&str) -> String) {
        for (job_id, argv) in self.queue.jobs() {
            if self.paths.done.join(&job_id).exists() || self.paths.failed.join(&job_id).exists() {
                continue;
            }
            assert_eq!(argv[1..3], ["dispatch".to_string(), "--id".to_string()]);
            let key = dispatch::parse_id(&argv[3]).expect("argv should carry a valid id");
            let prompt = dispatch::resolve_prompt(
                PromptSource::Stored(key),
                &self.store,
                tokio::io::empty(),
            )
            .await
            .expect("stored prompt should resolve");

            let output = format!("exec {}\n{}\n[exited]\n", argv.join(" "), agent(&prompt));
            std::fs::write(terminal_dir.join(&job_id), output).unwrap();
        }
    }

    fn reply_texts(&self) -> Vec<String> {
        self.messaging
            .replies()
            .into_iter()
            .map(|(_, text)| text)
            .collect()
    }
}

#[tokio::test]
async fn message_round_trips_through_queue_and_back() {
    let harness = harness();

    let outcome = harness.enqueuer.submit(&message(7, "what is 2+2?")).await;
    let IngressOutcome::Enqueued { job_id, directory } = outcome else {
        panic!("expected enqueued, got {outcome:?}");
    };
    assert!(directory.join("meta.json").exists());
    assert_eq!(
        harness.store.job_link(&job_id).unwrap().message_dir().await.unwrap(),
        directory
    );

    harness
        .execute_all(&harness.paths.done, |prompt| format!("You asked: {prompt} Answer: 4."))
        .await;
    let outcomes = harness.reconciler.scan().await;

    assert!(matches!(
        outcomes.as_slice(),
        [(name, ReconcileOutcome::Delivered { chunks: 1 })] if *name == job_id
    ));
    assert_eq!(
        harness.messaging.replies(),
        vec![(
            ReplyTarget {
                chat_id: CHAT,
                message_id: 7
            },
            "You asked: what is 2\\+2? Answer: 4\\.".to_string()
        )]
    );

    assert!(!harness.paths.done.join(&job_id).exists());
    assert!(directory.join(&job_id).exists(), "job file retired into message directory");
    assert!(std::fs::symlink_metadata(harness.store.root().join(format!("{job_id}.d"))).is_err());

    let again = harness.reconciler.reconcile(&harness.paths.done, &job_id).await;
    assert!(matches!(again, ReconcileOutcome::Skipped(SkipReason::JobFileMissing)));
    assert_eq!(harness.messaging.replies().len(), 1);
}

#[tokio::test]
async fn long_output_is_split_at_line_boundary() {
    let harness = harness();
    harness.enqueuer.submit(&message(8, "write a lot")).await;

    let a_run = "A".repeat(4000);
    let b_run = "B".repeat(1000);
    let body = format!("{a_run}\n{b_run}");
    harness.execute_all(&harness.paths.done, |_| body.clone()).await;
    harness.reconciler.scan().await;

    let replies = harness.messaging.replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].1, a_run);
    assert_eq!(replies[1].1, b_run);
    assert_eq!(replies[0].0, replies[1].0);
}

#[tokio::test]
async fn done_and_failed_jobs_are_delivered_oldest_first() {
    let harness = harness();
    harness.enqueuer.submit(&message(1, "first")).await;
    harness.execute_all(&harness.paths.failed, |_| "it broke".into()).await;
    harness.enqueuer.submit(&message(2, "second")).await;
    harness.execute_all(&harness.paths.done, |_| "it worked".into()).await;

    let outcomes = harness.reconciler.scan().await;

    let names: Vec<&str> = outcomes.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec![",0001.4000", ",0002.4001"]);
    assert_eq!(harness.reply_texts(), vec!["it broke".to_string(), "it worked".to_string()]);
}

#[tokio::test]
async fn scan_order_is_lexicographic_within_a_directory() {
    let harness = harness();
    for message_id in 1..=5 {
        harness
            .enqueuer
            .submit(&message(message_id, &format!("job {message_id}")))
            .await;
    }
    harness
        .execute_all(&harness.paths.done, |prompt| format!("done {prompt}"))
        .await;

    let outcomes = harness.reconciler.scan().await;

    let names: Vec<&String> = outcomes.iter().map(|(name, _)| name).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert_eq!(
        harness.reply_texts(),
        (1..=5).map(|n| format!("done job {n}")).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn stranger_never_reaches_the_queue() {
    let harness = harness();
    let stranger = InboundMessage {
        sender_id: Some(SENDER + 1),
        ..message(3, "let me in")
    };

    let outcome = harness.enqueuer.submit(&stranger).await;

    assert!(matches!(
        outcome,
        IngressOutcome::Rejected(Rejection::SenderNotAllowed)
    ));
    assert!(harness.queue.jobs().is_empty());
    assert_eq!(
        std::fs::read_dir(&harness.paths.store).unwrap().count(),
        0,
        "no message directory was created"
    );
}

#[tokio::test]
async fn attachment_only_message_with_failed_download_rolls_back() {
    let harness = harness();
    let voice_only = InboundMessage {
        text: None,
        kind: MessageKind::Voice(AttachmentRef {
            file_id: "gone".into(),
            mime_type: "audio/ogg".into(),
        }),
        ..message(4, "")
    };

    let outcome = harness.enqueuer.submit(&voice_only).await;

    assert!(matches!(outcome, IngressOutcome::RolledBack));
    assert!(harness.queue.jobs().is_empty());
    assert!(!harness.paths.store.join("telegram").join(format!("{CHAT}_4")).exists());
}

#[tokio::test]
async fn job_without_link_or_meta_is_left_alone() {
    let harness = harness();
    std::fs::write(harness.paths.done.join(",stray.1"), "a\nb\nc\n").unwrap();

    let outcomes = harness.reconciler.scan().await;

    assert!(matches!(
        outcomes.as_slice(),
        [(_, ReconcileOutcome::Skipped(SkipReason::LinkMissing))]
    ));
    assert!(harness.paths.done.join(",stray.1").exists());
    assert!(harness.messaging.sent().is_empty());
}
