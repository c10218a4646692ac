// rust/boost-runtime/src/watches.rs

//! Per-partition set of named training matrices.
//!
//! A worker builds one [`Watches`] from its shard at the start of a round,
//! hands it to the native training call and releases it afterwards, whether
//! training succeeded or not.

use std::fmt;
use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::{TEST_NAME, TRAIN_NAME};
use crate::data::{LabeledPoint, LabeledPointGroup};
use crate::error::{BoostError, Result};
use crate::native::{MatrixSource, NativeBackend, NativeMatrix};

/// Named native matrices owned by one partition's task.
///
/// Only matrices with at least one row are kept. Releasing frees every
/// matrix and removes the external-memory cache directory; it happens
/// exactly once, in [`Watches::delete`] or on drop.
pub struct Watches {
    matrices: Vec<(String, Box<dyn NativeMatrix>)>,
    cache_dir: Option<TempDir>,
    released: bool,
}

impl Watches {
    fn new(cache_dir: Option<TempDir>) -> Self {
        Self {
            matrices: Vec::new(),
            cache_dir,
            released: false,
        }
    }

    /// Number of non-empty matrices.
    pub fn size(&self) -> usize {
        self.matrices.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.matrices.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&dyn NativeMatrix> {
        self.matrices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_ref())
    }

    /// The training matrix, if it has any rows.
    pub fn train(&self) -> Option<&dyn NativeMatrix> {
        self.get(TRAIN_NAME)
    }

    /// `(name, matrix)` pairs in build order, for the native training call.
    pub fn watch_list(&self) -> Vec<(&str, &dyn NativeMatrix)> {
        self.matrices
            .iter()
            .map(|(name, m)| (name.as_str(), m.as_ref()))
            .collect()
    }

    /// External-memory cache directory, if one was created.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_ref().map(TempDir::path)
    }

    /// Releases every matrix and the cache directory.
    pub fn delete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.matrices.clear();

        if let Some(dir) = self.cache_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(
                    "Failed to remove external memory cache {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for Watches {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Display for Watches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Watches(")?;
        for (i, (name, matrix)) in self.matrices.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match matrix.row_count() {
                Ok(rows) => write!(f, "{name} -> {rows} rows")?,
                Err(_) => write!(f, "{name} -> ? rows")?,
            }
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Watches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watches")
            .field("names", &self.names().collect::<Vec<_>>())
            .field("cache_dir", &self.cache_dir())
            .finish()
    }
}

/// Splits `items` into `(accepted, rejected)` with one Bernoulli draw per
/// item: an item is accepted when a uniform draw in `[0, 1)` is `<= ratio`.
///
/// The outcome depends only on `seed`, `ratio` and the item order.
pub fn split_by_ratio<T>(items: Vec<T>, ratio: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut accepted = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for item in items {
        if rng.gen::<f64>() <= ratio {
            accepted.push(item);
        } else {
            rejected.push(item);
        }
    }
    (accepted, rejected)
}

/// Builds [`Watches`] for one partition.
pub struct WatchesBuilder<'a> {
    backend: &'a dyn NativeBackend,
    partition: usize,
    missing: f32,
    external_memory: bool,
    cache_root: Option<PathBuf>,
}

impl<'a> WatchesBuilder<'a> {
    pub fn new(backend: &'a dyn NativeBackend, partition: usize) -> Self {
        Self {
            backend,
            partition,
            missing: f32::NAN,
            external_memory: false,
            cache_root: None,
        }
    }

    #[must_use]
    pub fn with_missing(mut self, missing: f32) -> Self {
        self.missing = missing;
        self
    }

    /// Backs row matrices with an on-disk cache below `cache_root` (the
    /// system temp directory when `None`).
    #[must_use]
    pub fn with_external_memory(mut self, cache_root: Option<PathBuf>) -> Self {
        self.external_memory = true;
        self.cache_root = cache_root;
        self
    }

    /// Training points with an internal `"train"`/`"test"` holdout split.
    pub fn build_with_split(&self, points: Vec<LabeledPoint>, ratio: f64, seed: u64) -> Result<Watches> {
        let (train, test) = split_by_ratio(points, ratio, seed);
        self.build_from_sources(vec![
            (TRAIN_NAME.to_string(), MatrixSource::Rows(train)),
            (TEST_NAME.to_string(), MatrixSource::Rows(test)),
        ])
    }

    /// Training points plus externally supplied eval sets, in order.
    pub fn build_named(&self, datasets: Vec<(String, Vec<LabeledPoint>)>) -> Result<Watches> {
        self.build_from_sources(
            datasets
                .into_iter()
                .map(|(name, points)| (name, MatrixSource::Rows(points)))
                .collect(),
        )
    }

    /// Grouped variant of [`WatchesBuilder::build_with_split`]; whole groups
    /// go to either side of the split.
    pub fn build_grouped_with_split(
        &self,
        groups: Vec<LabeledPointGroup>,
        ratio: f64,
        seed: u64,
    ) -> Result<Watches> {
        let (train, test) = split_by_ratio(groups, ratio, seed);
        self.build_from_sources(vec![
            (TRAIN_NAME.to_string(), MatrixSource::Groups(train)),
            (TEST_NAME.to_string(), MatrixSource::Groups(test)),
        ])
    }

    /// Grouped variant of [`WatchesBuilder::build_named`].
    pub fn build_grouped_named(&self, datasets: Vec<(String, Vec<LabeledPointGroup>)>) -> Result<Watches> {
        self.build_from_sources(
            datasets
                .into_iter()
                .map(|(name, groups)| (name, MatrixSource::Groups(groups)))
                .collect(),
        )
    }

    /// Builds one matrix per source, dropping those without rows.
    ///
    /// On error every matrix built so far, and the cache directory, is
    /// released before returning.
    pub fn build_from_sources(&self, sources: Vec<(String, MatrixSource)>) -> Result<Watches> {
        let cache_dir = if self.external_memory {
            Some(self.create_cache_dir()?)
        } else {
            None
        };
        let mut watches = Watches::new(cache_dir);

        for (index, (name, source)) in sources.into_iter().enumerate() {
            // Named by position so no dataset name can leave the cache directory.
            let cache = watches
                .cache_dir()
                .map(|dir| dir.join(format!("matrix-{index}.cache")));
            let matrix = self.build_matrix(&name, source, cache.as_deref())?;
            if matrix.row_count()? == 0 {
                debug!(
                    "Dropping empty matrix '{}' in partition {}",
                    name, self.partition
                );
                continue;
            }
            watches.matrices.push((name, matrix));
        }

        Ok(watches)
    }

    /// Builds a single matrix and attaches its metadata.
    pub fn build_matrix(
        &self,
        name: &str,
        source: MatrixSource,
        cache: Option<&Path>,
    ) -> Result<Box<dyn NativeMatrix>> {
        match source {
            MatrixSource::Rows(points) => {
                let margins = collect_base_margins(name, &points)?;
                let mut matrix =
                    self.backend
                        .matrix_from_points(&mut points.into_iter(), self.missing, cache)?;
                if let Some(margins) = margins {
                    matrix.set_base_margin(&margins)?;
                }
                Ok(matrix)
            }
            MatrixSource::Groups(groups) => {
                let mut sizes = Vec::with_capacity(groups.len());
                let mut weights = Vec::with_capacity(groups.len());
                for group in &groups {
                    weights.push(self.group_weight(name, group)?);
                    sizes.push(u32::try_from(group.len()).map_err(|_| {
                        BoostError::partition(
                            self.partition,
                            format!("group {} is too large", group.group_id),
                        )
                    })?);
                }

                let points: Vec<LabeledPoint> =
                    groups.into_iter().flat_map(|g| g.points).collect();
                let margins = collect_base_margins(name, &points)?;
                let mut matrix =
                    self.backend
                        .matrix_from_points(&mut points.into_iter(), self.missing, cache)?;

                if !sizes.is_empty() {
                    matrix.set_group(&sizes)?;
                    matrix.set_weight(&weights)?;
                }
                if let Some(margins) = margins {
                    matrix.set_base_margin(&margins)?;
                }
                Ok(matrix)
            }
            MatrixSource::Columnar(batch) => self.backend.matrix_from_columnar(&batch, self.missing),
        }
    }

    fn group_weight(&self, name: &str, group: &LabeledPointGroup) -> Result<f32> {
        let Some(first) = group.points.first() else {
            return Ok(1.0);
        };
        if let Some(other) = group.points.iter().find(|p| p.weight != first.weight) {
            return Err(BoostError::partition(
                self.partition,
                format!(
                    "dataset '{name}': the instance weights should be the same within a group, \
                     but group {} (from partitions {:?}) has weights {} and {}",
                    group.group_id, group.partitions, first.weight, other.weight
                ),
            ));
        }
        Ok(first.weight)
    }

    fn create_cache_dir(&self) -> Result<TempDir> {
        let root = self
            .cache_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        tempfile::Builder::new()
            .prefix(&format!("dbr-cache-{}-", self.partition))
            .tempdir_in(&root)
            .map_err(|e| {
                BoostError::storage_with_source(&root, "failed to create external memory cache", e)
            })
    }
}

/// All-unset margins give `None`, all-set give the array, a mix is an error.
fn collect_base_margins(name: &str, points: &[LabeledPoint]) -> Result<Option<Vec<f32>>> {
    let set = points.iter().filter(|p| p.has_base_margin()).count();
    if set == 0 {
        return Ok(None);
    }
    if set != points.len() {
        return Err(BoostError::dataset(
            name,
            format!(
                "base margin is set for {set} of {} rows; set it for all rows or none",
                points.len()
            ),
        ));
    }
    Ok(Some(points.iter().map(|p| p.base_margin).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{
        CollectiveSession, ColumnarBatch, MemoryBackend, TrainOutput, TrainRequest,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn points(n: usize) -> Vec<LabeledPoint> {
        (0..n)
            .map(|i| LabeledPoint::dense(i as f32, vec![i as f32]))
            .collect()
    }

    fn group(id: i64, weights: &[f32]) -> LabeledPointGroup {
        LabeledPointGroup {
            group_id: id,
            points: weights
                .iter()
                .map(|&w| LabeledPoint::dense(0.0, vec![]).with_group(id).with_weight(w))
                .collect(),
            is_edge_group: false,
            partitions: vec![0, 1],
        }
    }

    fn rows(watches: &Watches, name: &str) -> Option<u64> {
        watches.get(name).map(|m| m.row_count().unwrap())
    }

    #[test]
    fn test_split_is_reproducible() {
        let (train_a, test_a) = split_by_ratio(points(1000), 0.7, 42);
        let (train_b, test_b) = split_by_ratio(points(1000), 0.7, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);

        // Roughly 70/30.
        assert!(train_a.len() > 600 && train_a.len() < 800, "{}", train_a.len());
        assert_eq!(train_a.len() + test_a.len(), 1000);

        let (train_c, _) = split_by_ratio(points(1000), 0.7, 43);
        assert_ne!(train_a, train_c);
    }

    #[test]
    fn test_split_ratio_one_has_no_test_rows() {
        let backend = MemoryBackend::new();
        let watches = WatchesBuilder::new(&backend, 0)
            .build_with_split(points(50), 1.0, 7)
            .unwrap();

        assert_eq!(rows(&watches, "train"), Some(50));
        assert!(watches.get("test").is_none());
        assert_eq!(watches.size(), 1);
        assert_eq!(watches.to_string(), "Watches(train -> 50 rows)");
    }

    #[test]
    fn test_split_keeps_both_sides() {
        let backend = MemoryBackend::new();
        let watches = WatchesBuilder::new(&backend, 0)
            .build_with_split(points(200), 0.5, 1)
            .unwrap();

        let train = rows(&watches, "train").unwrap();
        let test = rows(&watches, "test").unwrap();
        assert_eq!(train + test, 200);
        assert_eq!(watches.names().collect::<Vec<_>>(), vec!["train", "test"]);
    }

    #[test]
    fn test_named_drops_empty_eval() {
        let backend = MemoryBackend::new();
        let watches = WatchesBuilder::new(&backend, 3)
            .build_named(vec![
                ("train".to_string(), points(5)),
                ("valid".to_string(), Vec::new()),
                ("holdout".to_string(), points(2)),
            ])
            .unwrap();

        assert_eq!(watches.names().collect::<Vec<_>>(), vec!["train", "holdout"]);
        assert!(!watches.to_string().contains("valid"));
        assert_eq!(backend.live_matrices(), 2);
    }

    #[test]
    fn test_base_margin_rules() {
        assert_eq!(collect_base_margins("d", &points(3)).unwrap(), None);

        let all: Vec<_> = points(2).into_iter().map(|p| p.with_base_margin(0.5)).collect();
        assert_eq!(collect_base_margins("d", &all).unwrap(), Some(vec![0.5, 0.5]));

        let mut mixed = points(2);
        mixed[0].base_margin = 1.0;
        let err = collect_base_margins("valid", &mixed).unwrap_err();
        assert!(matches!(err, BoostError::Dataset { ref name, .. } if name == "valid"));
    }

    #[test]
    fn test_partial_base_margin_fails_build() {
        let backend = MemoryBackend::new();
        let mut train = points(4);
        train[2].base_margin = 0.3;

        let result = WatchesBuilder::new(&backend, 0).build_named(vec![("train".to_string(), train)]);
        assert!(result.is_err());
        assert_eq!(backend.live_matrices(), 0);
    }

    #[test]
    fn test_grouped_named_attaches_metadata() {
        let backend = RecordingBackend::default();
        let watches = WatchesBuilder::new(&backend, 0)
            .build_grouped_named(vec![(
                "train".to_string(),
                vec![group(1, &[2.0, 2.0]), group(2, &[0.5])],
            )])
            .unwrap();

        assert_eq!(rows(&watches, "train"), Some(3));
        let log = backend.log.lock().unwrap();
        assert_eq!(log.groups, vec![vec![2, 1]]);
        assert_eq!(log.weights, vec![vec![2.0, 0.5]]);
    }

    #[test]
    fn test_group_weight_mismatch_fails_every_grouped_path() {
        let backend = MemoryBackend::new();
        let builder = WatchesBuilder::new(&backend, 2);
        let bad = || vec![group(1, &[1.0]), group(9, &[1.0, 3.0])];

        let errors = [
            builder
                .build_grouped_named(vec![("train".to_string(), bad())])
                .unwrap_err(),
            builder
                .build_grouped_named(vec![
                    ("train".to_string(), vec![group(1, &[1.0])]),
                    ("valid".to_string(), bad()),
                ])
                .unwrap_err(),
            builder.build_grouped_with_split(bad(), 1.0, 0).unwrap_err(),
        ];

        for err in errors {
            assert!(matches!(err, BoostError::Partition { partition: 2, .. }));
            let message = err.to_string();
            assert!(message.contains("same within a group"), "{message}");
            assert!(message.contains("group 9"), "{message}");
            assert!(message.contains("[0, 1]"), "{message}");
        }
        assert_eq!(backend.live_matrices(), 0);
    }

    #[test]
    fn test_grouped_split_keeps_groups_whole() {
        let backend = MemoryBackend::new();
        let groups: Vec<_> = (0..100).map(|id| group(id, &[1.0, 1.0, 1.0])).collect();
        let watches = WatchesBuilder::new(&backend, 0)
            .build_grouped_with_split(groups, 0.6, 11)
            .unwrap();

        assert_eq!(rows(&watches, "train").unwrap() % 3, 0);
        assert_eq!(rows(&watches, "test").unwrap() % 3, 0);
    }

    #[test]
    fn test_columnar_source() {
        let backend = MemoryBackend::new();
        let batch = ColumnarBatch {
            columns: vec![vec![1.0, 2.0, 3.0]],
            labels: vec![0.0, 1.0, 0.0],
            ..Default::default()
        };
        let watches = WatchesBuilder::new(&backend, 0)
            .build_from_sources(vec![
                ("train".to_string(), MatrixSource::Rows(points(2))),
                ("columnar".to_string(), MatrixSource::Columnar(batch)),
            ])
            .unwrap();
        assert_eq!(rows(&watches, "columnar"), Some(3));
    }

    #[test]
    fn test_delete_releases_matrices_and_cache() {
        let backend = MemoryBackend::new();
        let root = tempfile::TempDir::new().unwrap();

        let watches = WatchesBuilder::new(&backend, 5)
            .with_external_memory(Some(root.path().to_path_buf()))
            .build_named(vec![
                ("train".to_string(), points(10)),
                ("valid".to_string(), points(3)),
            ])
            .unwrap();

        let cache = watches.cache_dir().unwrap().to_path_buf();
        assert!(cache.join("matrix-0.cache").exists());
        assert!(cache.join("matrix-1.cache").exists());
        assert!(cache
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .starts_with("dbr-cache-5-"));
        assert_eq!(backend.live_matrices(), 2);

        watches.delete();

        assert!(!cache.exists());
        assert_eq!(backend.live_matrices(), 0);
    }

    #[test]
    fn test_cache_files_stay_inside_cache_dir() {
        let backend = MemoryBackend::new();
        let root = tempfile::TempDir::new().unwrap();

        let watches = WatchesBuilder::new(&backend, 1)
            .with_external_memory(Some(root.path().to_path_buf()))
            .build_named(vec![
                ("train".to_string(), points(4)),
                ("../escaped".to_string(), points(2)),
            ])
            .unwrap();
        assert_eq!(rows(&watches, "../escaped"), Some(2));

        watches.delete();

        assert!(!root.path().join("escaped").exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_releases_like_delete() {
        let backend = MemoryBackend::new();
        let cache;
        {
            let watches = WatchesBuilder::new(&backend, 0)
                .with_external_memory(None)
                .build_named(vec![("train".to_string(), points(4))])
                .unwrap();
            cache = watches.cache_dir().unwrap().to_path_buf();
        }
        assert!(!cache.exists());
        assert_eq!(backend.live_matrices(), 0);
    }

    #[derive(Default)]
    struct Log {
        groups: Vec<Vec<u32>>,
        weights: Vec<Vec<f32>>,
    }

    /// Wraps the memory backend and records group metadata.
    #[derive(Default)]
    struct RecordingBackend {
        inner: MemoryBackend,
        log: Arc<Mutex<Log>>,
        released: Arc<AtomicUsize>,
    }

    struct RecordingMatrix {
        inner: Box<dyn NativeMatrix>,
        log: Arc<Mutex<Log>>,
        released: Arc<AtomicUsize>,
    }

    impl NativeMatrix for RecordingMatrix {
        fn row_count(&self) -> Result<u64> {
            self.inner.row_count()
        }

        fn labels(&self) -> Result<Vec<f32>> {
            self.inner.labels()
        }

        fn set_base_margin(&mut self, margins: &[f32]) -> Result<()> {
            self.inner.set_base_margin(margins)
        }

        fn set_group(&mut self, group_sizes: &[u32]) -> Result<()> {
            self.log.lock().unwrap().groups.push(group_sizes.to_vec());
            self.inner.set_group(group_sizes)
        }

        fn set_weight(&mut self, weights: &[f32]) -> Result<()> {
            self.log.lock().unwrap().weights.push(weights.to_vec());
            self.inner.set_weight(weights)
        }
    }

    impl Drop for RecordingMatrix {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl NativeBackend for RecordingBackend {
        fn matrix_from_points(
            &self,
            points: &mut dyn Iterator<Item = LabeledPoint>,
            missing: f32,
            cache: Option<&Path>,
        ) -> Result<Box<dyn NativeMatrix>> {
            Ok(Box::new(RecordingMatrix {
                inner: self.inner.matrix_from_points(points, missing, cache)?,
                log: Arc::clone(&self.log),
                released: Arc::clone(&self.released),
            }))
        }

        fn matrix_from_columnar(&self, batch: &ColumnarBatch, missing: f32) -> Result<Box<dyn NativeMatrix>> {
            self.inner.matrix_from_columnar(batch, missing)
        }

        fn open_collective(&self, env: &BTreeMap<String, String>) -> Result<Box<dyn CollectiveSession>> {
            self.inner.open_collective(env)
        }

        fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutput> {
            self.inner.train(request)
        }
    }

    #[test]
    fn test_test_matrix_without_rows_gets_no_metadata() {
        let backend = RecordingBackend::default();
        let groups = vec![group(1, &[1.0]), group(2, &[1.0, 1.0])];
        let watches = WatchesBuilder::new(&backend, 0)
            .build_grouped_with_split(groups, 1.0, 3)
            .unwrap();

        assert!(watches.get("test").is_none());
        // Only the train matrix received group metadata.
        assert_eq!(backend.log.lock().unwrap().groups, vec![vec![1, 2]]);

        watches.delete();
        assert_eq!(backend.released.load(Ordering::SeqCst), 2);
    }
}
