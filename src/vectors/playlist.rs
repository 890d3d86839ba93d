//! Similarity-ordered slideshow traversal.
//!
//! The playlist never runs dry: when its queue empties it picks the first
//! unvisited file as a seed, queues it, then queues every other unvisited
//! file similar enough to the seed, most similar first. Once every file has
//! been shown the visited set is cleared and the cycle starts over.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::IndexedRandom;

use super::{compare_batch, Embedding};
use crate::engine::EngineContext;

/// Refills attempted by a single `next_image` call before giving up.
const MAX_REFILLS: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct TraversalOptions {
    /// Run the model for candidates without a stored vector. Off by default:
    /// a refill then only costs lookups.
    pub compute_missing: bool,
}

pub struct SimilarityPlaylist {
    ctx: Arc<EngineContext>,
    options: TraversalOptions,
    files: Vec<PathBuf>,
    queue: VecDeque<PathBuf>,
    visited: HashSet<PathBuf>,
}

impl SimilarityPlaylist {
    pub fn new(ctx: Arc<EngineContext>, options: TraversalOptions) -> Self {
        Self {
            ctx,
            options,
            files: Vec::new(),
            queue: VecDeque::new(),
            visited: HashSet::new(),
        }
    }

    /// Replace the working set.
    ///
    /// Forgets the queue and visited set and reloads stored vectors, so a
    /// folder change never serves entries from the previous folder.
    pub fn set_files(&mut self, files: Vec<PathBuf>) {
        self.files = files;
        self.queue.clear();
        self.visited.clear();

        match self.ctx.reload() {
            Ok(count) => log::debug!("playlist reset with {} files, {count} stored vectors", self.files.len()),
            Err(e) => log::warn!("cannot reload vectors, continuing with cached ones: {e}"),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Files waiting to be shown, in order.
    pub fn queued(&self) -> impl Iterator<Item = &PathBuf> {
        self.queue.iter()
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Next file in similarity order, or `None` when the working set is empty.
    pub fn next_image(&mut self, threshold: f32) -> Option<PathBuf> {
        for _ in 0..=MAX_REFILLS {
            if let Some(next) = self.queue.pop_front() {
                self.visited.insert(next.clone());
                return Some(next);
            }

            if self.files.is_empty() {
                return None;
            }

            self.refill(threshold);
        }

        log::warn!("playlist refill produced nothing");
        None
    }

    /// Unordered pick from the working set.
    pub fn random_image(&self) -> Option<PathBuf> {
        self.files.choose(&mut rand::rng()).cloned()
    }

    fn refill(&mut self, threshold: f32) {
        let mut candidates: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|f| !self.visited.contains(*f))
            .cloned()
            .collect();

        if candidates.is_empty() {
            log::debug!("every file visited, starting a new cycle");
            self.visited.clear();
            candidates = self.files.clone();
        }

        let seed = candidates.remove(0);
        self.queue.push_back(seed.clone());

        let seed_vector = match self.ctx.embedding(&seed) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("no vector for seed {}: {e}", seed.display());
                return;
            }
        };

        let mut paths = Vec::with_capacity(candidates.len());
        let mut vectors: Vec<Embedding> = Vec::with_capacity(candidates.len());
        for path in candidates {
            let vector = if self.options.compute_missing {
                self.ctx.embedding(&path).ok()
            } else {
                self.ctx.cached_embedding(&path)
            };

            match vector {
                Some(v) if v.len() == seed_vector.len() => {
                    paths.push(path);
                    vectors.push(v);
                }
                Some(_) => log::debug!("dimension mismatch for {}", path.display()),
                None => {}
            }
        }

        match compare_batch(&seed_vector, &vectors, threshold) {
            Ok(matches) => {
                log::debug!(
                    "seed {} chained {} of {} candidates",
                    seed.display(),
                    matches.len(),
                    paths.len()
                );
                self.queue
                    .extend(matches.into_iter().map(|m| paths[m.index].clone()));
            }
            Err(e) => log::warn!("similarity ranking failed: {e}"),
        }

        if let Err(e) = self.ctx.persist() {
            log::warn!("cannot save vectors: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{write_corrupt, write_png, FakeEmbedder};
    use crate::vectors::{EmbeddingCache, VectorStore};
    use std::path::Path;

    fn playlist(dir: &Path, compute_missing: bool) -> (SimilarityPlaylist, Arc<FakeEmbedder>) {
        let fake = Arc::new(FakeEmbedder::new());
        let store = VectorStore::new(dir.join("vectors.json"), "fake");
        let ctx = EngineContext::open(store, EmbeddingCache::new(32), Some(fake.clone())).unwrap();
        let options = TraversalOptions { compute_missing };
        (SimilarityPlaylist::new(Arc::new(ctx), options), fake)
    }

    #[test]
    fn test_empty_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let (mut playlist, _) = playlist(dir.path(), true);

        assert_eq!(playlist.next_image(0.5), None);
        assert_eq!(playlist.random_image(), None);
    }

    #[test]
    fn test_chain_orders_by_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let red = write_png(dir.path(), "a.png", [250, 0, 0]);
        let blue = write_png(dir.path(), "b.png", [0, 0, 250]);
        let dark_red = write_png(dir.path(), "c.png", [120, 0, 0]);
        let orange = write_png(dir.path(), "d.png", [250, 60, 0]);

        let (mut playlist, _) = playlist(dir.path(), true);
        playlist.set_files(vec![red.clone(), blue.clone(), dark_red.clone(), orange.clone()]);

        assert_eq!(playlist.next_image(0.9), Some(red));
        let queued: Vec<_> = playlist.queued().cloned().collect();
        assert!(!queued.contains(&blue));
        assert!(queued.contains(&orange));

        // blue was below the threshold, so it seeds the next cycle
        while playlist.queued().next().is_some() {
            playlist.next_image(0.9);
        }
        assert_eq!(playlist.next_image(0.9), Some(blue));
    }

    #[test]
    fn test_cached_only_skips_unvectorized_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", [10, 10, 10]);
        let b = write_png(dir.path(), "b.png", [12, 10, 10]);

        let (mut playlist, fake) = playlist(dir.path(), false);
        playlist.set_files(vec![a.clone(), b.clone()]);

        assert_eq!(playlist.next_image(0.0), Some(a));
        assert_eq!(playlist.queued().count(), 0);
        assert_eq!(fake.calls(), 1);

        assert_eq!(playlist.next_image(0.0), Some(b));
    }

    #[test]
    fn test_unreadable_seed_is_still_shown() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_corrupt(dir.path(), "a.png");
        let good = write_png(dir.path(), "b.png", [1, 2, 3]);

        let (mut playlist, _) = playlist(dir.path(), true);
        playlist.set_files(vec![bad.clone(), good.clone()]);

        assert_eq!(playlist.next_image(0.0), Some(bad));
        assert_eq!(playlist.next_image(0.0), Some(good));
    }

    #[test]
    fn test_cycle_restarts_after_all_visited() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", [255, 0, 0]);
        let b = write_png(dir.path(), "b.png", [0, 255, 0]);

        let (mut playlist, _) = playlist(dir.path(), true);
        playlist.set_files(vec![a.clone(), b.clone()]);

        assert_eq!(playlist.next_image(0.99), Some(a.clone()));
        assert_eq!(playlist.next_image(0.99), Some(b));
        assert_eq!(playlist.visited_count(), 2);

        assert_eq!(playlist.next_image(0.99), Some(a));
        assert_eq!(playlist.visited_count(), 1);
    }

    #[test]
    fn test_set_files_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", [200, 200, 0]);
        let b = write_png(dir.path(), "b.png", [190, 200, 0]);
        let other = write_png(dir.path(), "z.png", [0, 0, 0]);

        let (mut playlist, _) = playlist(dir.path(), true);
        playlist.set_files(vec![a.clone(), b]);
        assert_eq!(playlist.next_image(0.0), Some(a));
        assert!(playlist.queued().next().is_some());

        playlist.set_files(vec![other.clone()]);
        assert_eq!(playlist.visited_count(), 0);
        assert_eq!(playlist.queued().count(), 0);
        assert_eq!(playlist.next_image(0.0), Some(other));
    }

    #[test]
    fn test_random_image_comes_from_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<_> = (0..4u8)
            .map(|i| write_png(dir.path(), &format!("{i}.png"), [i * 40, 0, 0]))
            .collect();

        let (mut playlist, _) = playlist(dir.path(), false);
        playlist.set_files(files.clone());

        for _ in 0..10 {
            let pick = playlist.random_image().unwrap();
            assert!(files.contains(&pick));
        }
    }
}
