//! Rank a set of images against one target and move the matches.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{compare_batch, Embedding};
use crate::engine::EngineContext;
use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct SimilarOptions {
    /// Run the model for files without a stored vector.
    pub compute_missing: bool,
    /// Checked between files and between model batches.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SimilarOptions {
    fn default() -> Self {
        Self {
            compute_missing: true,
            cancel: None,
        }
    }
}

impl SimilarOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarImage {
    pub path: PathBuf,
    pub score: f32,
}

/// Find the files in `files` whose similarity to `target` is at least
/// `threshold`, most similar first. The target itself is never returned and
/// a path listed twice is ranked once.
///
/// Fails only when the target has no vector. Per-file failures are logged
/// and the file is left out. Without a model only cached vectors are ranked.
/// Vectors computed along the way are saved once at the end.
pub fn find_similar(
    ctx: &EngineContext,
    target: &Path,
    files: &[PathBuf],
    threshold: f32,
    options: &SimilarOptions,
) -> Result<Vec<SimilarImage>, EngineError> {
    let target_vector = ctx.embedding(target)?;

    let mut seen = HashSet::with_capacity(files.len());
    let others: Vec<&PathBuf> = files
        .iter()
        .filter(|p| p.as_path() != target && seen.insert(p.as_path()))
        .collect();
    let mut vectors: Vec<Option<Embedding>> =
        others.iter().map(|p| ctx.cached_embedding(p)).collect();

    let missing: Vec<PathBuf> = others
        .iter()
        .zip(&vectors)
        .filter(|(_, v)| v.is_none())
        .map(|(p, _)| (*p).clone())
        .collect();

    match ctx.embedder() {
        _ if missing.is_empty() || !options.compute_missing || options.cancelled() => {}
        None => log::warn!(
            "no embedding model loaded, ranking cached vectors only ({} files without one)",
            missing.len()
        ),
        Some(embedder) => {
            log::info!("computing {} missing vectors", missing.len());
            let batch_size = embedder.batch_size().max(1);

            let slots: HashMap<&PathBuf, usize> =
                others.iter().enumerate().map(|(i, p)| (*p, i)).collect();

            for chunk in missing.chunks(batch_size) {
                if options.cancelled() {
                    log::info!("similar-image search cancelled");
                    break;
                }
                for (path, vector) in ctx.compute_embeddings(chunk)? {
                    if let Some(&i) = slots.get(&path) {
                        vectors[i] = Some(vector);
                    }
                }
            }
        }
    }

    let mut paths = Vec::with_capacity(others.len());
    let mut candidates = Vec::with_capacity(others.len());
    for (path, vector) in others.into_iter().zip(vectors) {
        match vector {
            Some(v) if v.len() == target_vector.len() => {
                paths.push(path);
                candidates.push(v);
            }
            Some(_) => log::warn!("dimension mismatch for {}, skipping", path.display()),
            None => log::debug!("no vector for {}", path.display()),
        }
    }

    let matches = compare_batch(&target_vector, &candidates, threshold)?;

    ctx.persist()?;

    Ok(matches
        .into_iter()
        .map(|m| SimilarImage {
            path: paths[m.index].clone(),
            score: m.score,
        })
        .collect())
}

#[derive(Debug, Default)]
pub struct MoveReport {
    /// Destination paths of the files that were moved.
    pub moved: Vec<PathBuf>,
    /// Source paths left in place, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Move files into `dest`, creating it if needed. Existing files in `dest`
/// are never overwritten.
pub fn move_files(paths: &[PathBuf], dest: &Path) -> MoveReport {
    let mut report = MoveReport::default();

    if let Err(e) = std::fs::create_dir_all(dest) {
        let reason = format!("cannot create {}: {e}", dest.display());
        log::error!("{reason}");
        report.skipped = paths.iter().map(|p| (p.clone(), reason.clone())).collect();
        return report;
    }

    for path in paths {
        match move_one(path, dest) {
            Ok(target) => {
                log::debug!("moved {} to {}", path.display(), target.display());
                report.moved.push(target);
            }
            Err(reason) => {
                log::warn!("not moving {}: {reason}", path.display());
                report.skipped.push((path.clone(), reason));
            }
        }
    }

    report
}

fn move_one(path: &Path, dest: &Path) -> Result<PathBuf, String> {
    let name = path.file_name().ok_or_else(|| "no file name".to_string())?;
    let target = dest.join(name);

    if target.exists() {
        return Err(format!("{} already exists", target.display()));
    }

    if std::fs::rename(path, &target).is_ok() {
        return Ok(target);
    }

    // rename fails across filesystems
    std::fs::copy(path, &target).map_err(|e| e.to_string())?;
    if let Err(e) = std::fs::remove_file(path) {
        let _ = std::fs::remove_file(&target);
        return Err(e.to_string());
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{write_corrupt, write_png, FakeEmbedder};
    use crate::vectors::{EmbeddingCache, VectorStore};

    fn context(dir: &Path) -> (EngineContext, Arc<FakeEmbedder>) {
        let fake = Arc::new(FakeEmbedder::new());
        let store = VectorStore::new(dir.join("vectors.json"), "fake");
        let ctx = EngineContext::open(store, EmbeddingCache::new(32), Some(fake.clone())).unwrap();
        (ctx, fake)
    }

    #[test]
    fn test_find_similar_ranks_and_excludes_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [250, 0, 0]);
        let close = write_png(dir.path(), "close.png", [250, 30, 0]);
        let closer = write_png(dir.path(), "closer.png", [250, 5, 0]);
        let far = write_png(dir.path(), "far.png", [0, 0, 250]);
        let files = vec![target.clone(), close.clone(), far, closer.clone()];

        let (ctx, _) = context(dir.path());
        let results = find_similar(&ctx, &target, &files, 0.9, &SimilarOptions::default()).unwrap();

        let paths: Vec<_> = results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths, vec![closer, close]);
        assert!(results[0].score >= results[1].score);
        assert!(ctx.store().exists());
    }

    #[test]
    fn test_find_similar_cached_only() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [0, 250, 0]);
        let other = write_png(dir.path(), "other.png", [0, 240, 0]);
        let files = vec![target.clone(), other.clone()];

        let (ctx, fake) = context(dir.path());
        let options = SimilarOptions {
            compute_missing: false,
            cancel: None,
        };

        let results = find_similar(&ctx, &target, &files, 0.0, &options).unwrap();
        assert!(results.is_empty());
        assert_eq!(fake.calls(), 1);

        ctx.embedding(&other).unwrap();
        let results = find_similar(&ctx, &target, &files, 0.0, &options).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, other);
    }

    #[test]
    fn test_find_similar_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [90, 90, 90]);
        let twin = write_png(dir.path(), "twin.png", [91, 90, 90]);
        let broken = write_corrupt(dir.path(), "broken.png");

        let (ctx, _) = context(dir.path());
        let results = find_similar(
            &ctx,
            &target,
            &[broken, twin.clone()],
            0.5,
            &SimilarOptions::default(),
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, twin);
    }

    #[test]
    fn test_find_similar_unreadable_target_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_corrupt(dir.path(), "target.png");
        let (ctx, _) = context(dir.path());

        let result = find_similar(&ctx, &target, &[], 0.5, &SimilarOptions::default());
        assert!(matches!(result, Err(EngineError::ImageLoad { .. })));
    }

    #[test]
    fn test_find_similar_cancelled_before_computing() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [5, 5, 5]);
        let other = write_png(dir.path(), "other.png", [6, 5, 5]);

        let (ctx, fake) = context(dir.path());
        let options = SimilarOptions {
            compute_missing: true,
            cancel: Some(Arc::new(AtomicBool::new(true))),
        };

        let results = find_similar(&ctx, &target, &[target.clone(), other], 0.0, &options).unwrap();
        assert!(results.is_empty());
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_find_similar_without_model_uses_cached_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [250, 0, 0]);
        let cached = write_png(dir.path(), "cached.png", [250, 5, 0]);
        let uncached = write_png(dir.path(), "uncached.png", [245, 5, 0]);

        let (ctx, _) = context(dir.path());
        ctx.embedding(&target).unwrap();
        ctx.embedding(&cached).unwrap();
        ctx.persist().unwrap();

        let store = VectorStore::new(dir.path().join("vectors.json"), "fake");
        let offline = EngineContext::open(store, EmbeddingCache::new(8), None).unwrap();
        let files = vec![target.clone(), cached.clone(), uncached.clone()];

        let results = find_similar(&offline, &target, &files, 0.0, &SimilarOptions::default()).unwrap();
        let paths: Vec<_> = results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths, vec![cached]);

        let missing_target = find_similar(&offline, &uncached, &files, 0.0, &SimilarOptions::default());
        assert!(matches!(missing_target, Err(EngineError::AiModel(_))));
    }

    #[test]
    fn test_find_similar_computes_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_png(dir.path(), "target.png", [128, 128, 128]);
        let mut files = vec![target.clone()];
        for i in 0..20u8 {
            files.push(write_png(dir.path(), &format!("{i:02}.png"), [i * 12, 255 - i * 12, i]));
        }
        // the same path listed twice
        files.push(files[3].clone());

        let (ctx, fake) = context(dir.path());
        let results = find_similar(&ctx, &target, &files, -1.0, &SimilarOptions::default()).unwrap();

        assert_eq!(fake.calls(), 21);
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.path != target));
    }

    #[test]
    fn test_move_files_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sorted");
        std::fs::create_dir_all(&dest).unwrap();

        let a = write_png(dir.path(), "a.png", [1, 1, 1]);
        let b = write_png(dir.path(), "b.png", [2, 2, 2]);
        std::fs::write(dest.join("b.png"), b"already here").unwrap();

        let report = move_files(&[a.clone(), b.clone()], &dest);

        assert_eq!(report.moved, vec![dest.join("a.png")]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, b);
        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(std::fs::read(dest.join("b.png")).unwrap(), b"already here");
    }

    #[test]
    fn test_move_files_creates_destination() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", [3, 3, 3]);
        let dest = dir.path().join("new").join("folder");

        let report = move_files(&[a], &dest);

        assert_eq!(report.moved.len(), 1);
        assert!(dest.join("a.png").exists());
    }
}
