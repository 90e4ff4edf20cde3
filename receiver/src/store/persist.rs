//! Durable mirror of the submission store.
//!
//! Writes are handed to a bounded queue and applied by one background task,
//! so request handlers never wait on disk and never see a write failure.
//! Failures are logged, counted, and broadcast to anyone subscribed.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::Submission;
use crate::error::PersistenceError;

/// Storage used for crash recovery.
#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    async fn save(&self, submission: &Submission) -> Result<(), PersistenceError>;

    async fn remove(&self, id: &str) -> Result<(), PersistenceError>;

    async fn load_all(&self) -> Result<Vec<Submission>, PersistenceError>;
}

// =============================================================================
// JSON directory repository
// =============================================================================

/// One `<id>.json` file per submission.
#[derive(Debug, Clone)]
pub struct JsonDirRepository {
    dir: PathBuf,
}

impl JsonDirRepository {
    /// Open (creating if needed) the directory at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl SubmissionRepository for JsonDirRepository {
    async fn save(&self, submission: &Submission) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec(submission)?;
        let path = self.path_for(&submission.id);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<Submission>, PersistenceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut submissions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let body = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Submission>(&body) {
                Ok(submission) => submissions.push(submission),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "persistence_file_unreadable");
                }
            }
        }

        Ok(submissions)
    }
}

// =============================================================================
// Background writer
// =============================================================================

enum PersistJob {
    Save(Submission),
    Remove(Vec<String>),
    Flush(oneshot::Sender<()>),
}

impl PersistJob {
    fn name(&self) -> &'static str {
        match self {
            PersistJob::Save(_) => "save",
            PersistJob::Remove(_) => "remove",
            PersistJob::Flush(_) => "flush",
        }
    }
}

/// A write the background task could not apply.
#[derive(Debug, Clone)]
pub struct PersistFailure {
    pub operation: &'static str,
    pub submission_id: String,
    pub error: String,
}

#[derive(Default)]
struct WriterCounters {
    failures: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle feeding the background persistence task.
///
/// The task exits once every handle is dropped and the queue drains.
#[derive(Clone)]
pub struct PersistenceWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<WriterCounters>,
    failures_tx: broadcast::Sender<PersistFailure>,
}

impl PersistenceWriter {
    /// Start the background task with a queue of `depth` jobs.
    pub fn spawn(
        repository: Arc<dyn SubmissionRepository>,
        depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let (failures_tx, _) = broadcast::channel(64);
        let counters = Arc::new(WriterCounters::default());

        let handle = tokio::spawn(run_writer(
            repository,
            rx,
            Arc::clone(&counters),
            failures_tx.clone(),
        ));

        info!(queue_depth = depth, "persistence_writer_started");

        (
            Self {
                inner: Arc::new(WriterInner {
                    tx,
                    counters,
                    failures_tx,
                }),
            },
            handle,
        )
    }

    /// Queue a save. Never blocks; a full queue drops the job.
    pub fn save(&self, submission: Submission) {
        self.enqueue(PersistJob::Save(submission));
    }

    /// Queue removal of `ids`.
    pub fn remove(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        self.enqueue(PersistJob::Remove(ids));
    }

    fn enqueue(&self, job: PersistJob) {
        let name = job.name();
        if let Err(e) = self.inner.tx.try_send(job) {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let error = match e {
                mpsc::error::TrySendError::Full(_) => PersistenceError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PersistenceError::Closed,
            };
            warn!(operation = name, error = %error, "persistence_write_error");
        }
    }

    /// Wait until every job queued before this call has been applied.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .tx
            .send(PersistJob::Flush(done_tx))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        done_rx.await.map_err(|_| PersistenceError::Closed)
    }

    /// Receive every failed write from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistFailure> {
        self.inner.failures_tx.subscribe()
    }

    pub fn failures(&self) -> u64 {
        self.inner.counters.failures.load(Ordering::Relaxed)
    }

    /// Jobs dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.inner.counters.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer(
    repository: Arc<dyn SubmissionRepository>,
    mut rx: mpsc::Receiver<PersistJob>,
    counters: Arc<WriterCounters>,
    failures_tx: broadcast::Sender<PersistFailure>,
) {
    let report = |operation: &'static str, id: &str, error: PersistenceError| {
        counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation = operation,
            submission_id = %id,
            error = %error,
            "persistence_write_error"
        );
        // No subscribers is fine.
        let _ = failures_tx.send(PersistFailure {
            operation,
            submission_id: id.to_string(),
            error: error.to_string(),
        });
    };

    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Save(submission) => match repository.save(&submission).await {
                Ok(()) => debug!(submission_id = %submission.id, "persistence_saved"),
                Err(e) => report("save", &submission.id, e),
            },
            PersistJob::Remove(ids) => {
                for id in &ids {
                    if let Err(e) = repository.remove(id).await {
                        report("remove", id, e);
                    }
                }
                debug!(count = ids.len(), "persistence_removed");
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    info!("persistence_writer_stopped");
}
