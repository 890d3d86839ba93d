//! Background vectorization of a whole folder.
//!
//! One worker thread per job walks the files in order, fingerprints each,
//! skips those already in the store and embeds the rest. Cancellation and the
//! wall-clock timeout are checked between files; whatever was computed up to
//! that point is merged into the engine's map and saved in a single write at
//! the end, so vectors persisted by other callers in the meantime survive.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{file_fingerprint, Embedding, FeatureEmbedder, VectorMap};
use crate::engine::EngineContext;
use crate::errors::EngineError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Stop after this much wall-clock time; partial results are kept.
    pub timeout: Duration,
    /// Pause between files so the UI thread stays responsive.
    pub throttle: Duration,
    pub heartbeat: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            throttle: DEFAULT_THROTTLE,
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based index of the file just handled
    pub current: usize,
    pub total: usize,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    TimedOut,
    ModelUnavailable,
    StoreFailed(String),
    /// The worker panicked; nothing from this run was saved.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub processed: usize,
    pub added: usize,
    pub already_present: usize,
    pub failed: usize,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            added: 0,
            already_present: 0,
            failed: 0,
            outcome: BatchOutcome::Completed,
        }
    }

    /// One-line human readable result.
    pub fn summary(&self) -> String {
        let counts = if self.failed > 0 {
            format!("{} added ({} failed)", self.added, self.failed)
        } else {
            format!("{} added", self.added)
        };

        match &self.outcome {
            BatchOutcome::Completed if self.failed == 0 => {
                format!("Vectorization complete: {counts}")
            }
            BatchOutcome::Completed => {
                format!("Vectorization complete with errors: {counts}")
            }
            BatchOutcome::Cancelled => format!(
                "Vectorization cancelled after {}/{} files: {counts}",
                self.processed, self.total
            ),
            BatchOutcome::TimedOut => format!(
                "Vectorization timed out after {}/{} files: {counts}",
                self.processed, self.total
            ),
            BatchOutcome::ModelUnavailable => {
                "Vectorization skipped: embedding model unavailable".to_string()
            }
            BatchOutcome::StoreFailed(reason) => {
                format!("Vectorization failed, vector file not updated: {reason}")
            }
            BatchOutcome::Aborted(reason) => format!(
                "Vectorization aborted after {}/{} files: {reason}",
                self.processed, self.total
            ),
        }
    }
}

/// Releases the single-job slot even if the worker panics.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A running vectorization job.
pub struct BatchJob {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<BatchReport>,
    total: usize,
}

impl BatchJob {
    /// Ask the worker to stop before the next file.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Flag shared with the worker, e.g. for a Ctrl-C handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and return its report.
    pub fn join(self) -> BatchReport {
        match self.handle.join() {
            Ok(report) => report,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                log::error!("vectorization worker panicked: {reason}");
                aborted(self.total, reason)
            }
        }
    }
}

fn aborted(total: usize, reason: String) -> BatchReport {
    BatchReport {
        outcome: BatchOutcome::Aborted(reason),
        ..BatchReport::new(total)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Starts vectorization jobs, at most one at a time.
pub struct BatchVectorizer {
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
}

impl BatchVectorizer {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<RunningGuard, EngineError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::JobRunning)?;
        Ok(RunningGuard(self.running.clone()))
    }

    /// Vectorize `files` on a worker thread.
    ///
    /// `on_progress` runs on the worker after every file, `on_finish` once with
    /// the final report, also when the worker panics. Fails with `JobRunning`
    /// while a previous job is active.
    pub fn start<P, F>(
        &self,
        files: Vec<PathBuf>,
        options: BatchOptions,
        mut on_progress: P,
        on_finish: F,
    ) -> Result<BatchJob, EngineError>
    where
        P: FnMut(BatchProgress) + Send + 'static,
        F: FnOnce(&BatchReport) + Send + 'static,
    {
        let guard = self.acquire()?;

        let ctx = self.ctx.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let total = files.len();

        log::info!("starting vectorization of {total} files");
        let handle = std::thread::Builder::new()
            .name("vectorize".to_string())
            .spawn(move || {
                let _guard = guard;
                let report = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_batch(&ctx, &files, &options, &worker_cancel, &mut on_progress)
                }))
                .unwrap_or_else(|payload| {
                    let reason = panic_message(payload.as_ref());
                    log::error!("vectorization worker panicked: {reason}");
                    aborted(total, reason)
                });
                log::info!("{}", report.summary());
                on_finish(&report);
                report
            })
            .map_err(|e| EngineError::vector_with("cannot spawn vectorization worker", e))?;

        Ok(BatchJob {
            cancel,
            handle,
            total,
        })
    }

    /// Vectorize `files` on the calling thread. Shares the single-job slot
    /// with [`BatchVectorizer::start`].
    pub fn run(
        &self,
        files: &[PathBuf],
        options: &BatchOptions,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(BatchProgress),
    ) -> Result<BatchReport, EngineError> {
        let _guard = self.acquire()?;
        Ok(run_batch(&self.ctx, files, options, cancel, &mut on_progress))
    }
}

fn run_batch(
    ctx: &EngineContext,
    files: &[PathBuf],
    options: &BatchOptions,
    cancel: &AtomicBool,
    on_progress: &mut dyn FnMut(BatchProgress),
) -> BatchReport {
    let total = files.len();
    let mut report = BatchReport::new(total);

    let Some(embedder) = ctx.embedder().cloned() else {
        log::warn!("no embedding model loaded, skipping vectorization");
        report.outcome = BatchOutcome::ModelUnavailable;
        return report;
    };

    // pick up entries another process wrote since the session started; an
    // unreadable file must not be replaced by whatever this run computes
    match ctx.store().load() {
        Ok(on_disk) => {
            ctx.merge(on_disk);
        }
        Err(e) => {
            log::error!("cannot load vector file, aborting: {e}");
            report.outcome = BatchOutcome::StoreFailed(e.to_string());
            return report;
        }
    }

    let mut added = VectorMap::new();
    let mut computed: Vec<(PathBuf, Embedding)> = Vec::new();
    let started = Instant::now();
    let mut last_heartbeat = started;

    for (index, path) in files.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            log::info!("vectorization cancelled at {index}/{total}");
            report.outcome = BatchOutcome::Cancelled;
            break;
        }
        if started.elapsed() >= options.timeout {
            log::warn!(
                "vectorization timed out after {:?} at {index}/{total}",
                options.timeout
            );
            report.outcome = BatchOutcome::TimedOut;
            break;
        }
        if last_heartbeat.elapsed() >= options.heartbeat {
            log::info!(
                "vectorizing: {index}/{total} files, {} added, {} failed",
                report.added,
                report.failed
            );
            last_heartbeat = Instant::now();
        }

        match vectorize_file(ctx, embedder.as_ref(), path, &added) {
            Ok(FileResult::Present) => report.already_present += 1,
            Ok(FileResult::Added(fingerprint, vector)) => {
                added.insert(fingerprint, vector.clone());
                computed.push((path.clone(), vector));
                report.added += 1;
            }
            Err(e) => {
                log::warn!("{e}");
                report.failed += 1;
            }
        }
        report.processed += 1;

        on_progress(BatchProgress {
            current: index + 1,
            total,
            file_name: display_name(path),
        });

        if !options.throttle.is_zero() && index + 1 < total {
            std::thread::sleep(options.throttle);
        }
    }

    if report.added > 0 {
        ctx.merge(added);
        if let Err(e) = ctx.persist() {
            log::error!("cannot save vector file: {e}");
            report.outcome = BatchOutcome::StoreFailed(e.to_string());
        }
        for (path, vector) in computed {
            ctx.remember(&path, vector);
        }
    }

    report
}

enum FileResult {
    Present,
    Added(String, Embedding),
}

fn vectorize_file(
    ctx: &EngineContext,
    embedder: &dyn FeatureEmbedder,
    path: &Path,
    added: &VectorMap,
) -> Result<FileResult, EngineError> {
    let fingerprint = file_fingerprint(path)?;
    if added.contains_key(&fingerprint) || ctx.has_fingerprint(&fingerprint) {
        return Ok(FileResult::Present);
    }

    let vector = embedder.embed(path)?;
    Ok(FileResult::Added(fingerprint, vector))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{write_corrupt, write_png, FakeEmbedder};
    use crate::vectors::{EmbeddingCache, VectorStore};
    use std::sync::Mutex;

    fn vectorizer(dir: &Path, fake: Option<Arc<FakeEmbedder>>) -> BatchVectorizer {
        let store = VectorStore::new(dir.join("vectors.json"), "fake");
        let embedder = fake.map(|f| f as Arc<dyn FeatureEmbedder>);
        let ctx = EngineContext::open(store, EmbeddingCache::new(32), embedder).unwrap();
        BatchVectorizer::new(Arc::new(ctx))
    }

    fn options() -> BatchOptions {
        BatchOptions {
            throttle: Duration::ZERO,
            ..BatchOptions::default()
        }
    }

    #[test]
    fn test_run_adds_and_skips_present() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_png(dir.path(), "a.png", [10, 0, 0]),
            write_png(dir.path(), "b.png", [0, 10, 0]),
        ];
        let fake = Arc::new(FakeEmbedder::new());
        let batch = vectorizer(dir.path(), Some(fake.clone()));
        let cancel = AtomicBool::new(false);

        let report = batch.run(&files, &options(), &cancel, |_| {}).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.summary(), "Vectorization complete: 2 added");

        let again = batch.run(&files, &options(), &cancel, |_| {}).unwrap();
        assert_eq!(again.added, 0);
        assert_eq!(again.already_present, 2);
        assert_eq!(fake.calls(), 2);
    }

    #[test]
    fn test_duplicate_content_embedded_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_png(dir.path(), "a.png", [7, 7, 7]),
            write_png(dir.path(), "copy.png", [7, 7, 7]),
        ];
        let fake = Arc::new(FakeEmbedder::new());
        let batch = vectorizer(dir.path(), Some(fake.clone()));

        let report = batch.run(&files, &options(), &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.already_present, 1);
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_progress_reports_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_png(dir.path(), "a.png", [1, 0, 0]),
            write_corrupt(dir.path(), "b.png"),
            write_png(dir.path(), "c.png", [0, 0, 1]),
        ];
        let batch = vectorizer(dir.path(), Some(Arc::new(FakeEmbedder::new())));

        let mut seen = Vec::new();
        let report = batch
            .run(&files, &options(), &AtomicBool::new(false), |p| seen.push(p))
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].current, 2);
        assert_eq!(seen[1].total, 3);
        assert_eq!(seen[1].file_name, "b.png");
        assert_eq!(report.failed, 1);
        assert_eq!(report.summary(), "Vectorization complete with errors: 2 added (1 failed)");
    }

    #[test]
    fn test_inference_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_png(dir.path(), "a.png", [1, 0, 0]),
            write_png(dir.path(), "b.png", [0, 1, 0]),
        ];
        let fake = Arc::new(FakeEmbedder::new().failing_on("a.png"));
        let batch = vectorizer(dir.path(), Some(fake));

        let report = batch.run(&files, &options(), &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
        assert_eq!(report.outcome, BatchOutcome::Completed);
    }

    #[test]
    fn test_no_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![write_png(dir.path(), "a.png", [1, 1, 1])];
        let batch = vectorizer(dir.path(), None);

        let report = batch.run(&files, &options(), &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(report.outcome, BatchOutcome::ModelUnavailable);
        assert_eq!(report.processed, 0);
        assert!(!dir.path().join("vectors.json").exists());
    }

    #[test]
    fn test_unreadable_store_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![write_png(dir.path(), "a.png", [1, 1, 1])];
        let batch = vectorizer(dir.path(), Some(Arc::new(FakeEmbedder::new())));
        std::fs::write(dir.path().join("vectors.json"), "{ broken").unwrap();

        let report = batch.run(&files, &options(), &AtomicBool::new(false), |_| {}).unwrap();
        assert!(matches!(report.outcome, BatchOutcome::StoreFailed(_)));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("vectors.json")).unwrap(),
            "{ broken"
        );
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![write_png(dir.path(), "a.png", [1, 1, 1])];
        let batch = vectorizer(dir.path(), Some(Arc::new(FakeEmbedder::new())));

        let report = batch.run(&files, &options(), &AtomicBool::new(true), |_| {}).unwrap();
        assert_eq!(report.outcome, BatchOutcome::Cancelled);
        assert_eq!(report.processed, 0);
        assert!(report.summary().contains("cancelled after 0/1"));
    }

    #[test]
    fn test_start_calls_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![write_png(dir.path(), "a.png", [1, 2, 3])];
        let batch = vectorizer(dir.path(), Some(Arc::new(FakeEmbedder::new())));

        let finished = Arc::new(Mutex::new(None));
        let sink = finished.clone();
        let job = batch
            .start(files, options(), |_| {}, move |r| {
                *sink.lock().unwrap() = Some(r.summary());
            })
            .unwrap();

        let report = job.join();
        assert_eq!(report.added, 1);
        assert_eq!(
            finished.lock().unwrap().as_deref(),
            Some("Vectorization complete: 1 added")
        );
        assert!(!batch.is_running());
    }

    #[test]
    fn test_panicking_worker_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_png(dir.path(), "a.png", [1, 2, 3]),
            write_png(dir.path(), "b.png", [3, 2, 1]),
        ];
        let batch = vectorizer(dir.path(), Some(Arc::new(FakeEmbedder::new())));

        let finished = Arc::new(Mutex::new(None));
        let sink = finished.clone();
        let job = batch
            .start(
                files,
                options(),
                |p| {
                    if p.current == 1 {
                        panic!("progress sink failed");
                    }
                },
                move |r| *sink.lock().unwrap() = Some(r.outcome.clone()),
            )
            .unwrap();

        let report = job.join();
        let expected = BatchOutcome::Aborted("progress sink failed".to_string());
        assert_eq!(report.outcome, expected);
        assert_eq!(finished.lock().unwrap().as_ref(), Some(&expected));
        assert!(report.summary().starts_with("Vectorization aborted"));
        assert!(!batch.is_running());
    }
}
