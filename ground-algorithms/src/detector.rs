//! The ground detection pipeline.
//!
//! A run goes through four phases:
//!
//! 1. Build a quadtree over the point source so that no tile is larger than the maximum structure size
//! 2. Select seed points per tile
//! 3. Exclude seed outliers, triangulate the remaining seeds, resolve the thresholds and optionally densify
//!    the surface
//! 4. Classify all tiles on a pool of worker threads
//!
//! The point source is only ever touched by the calling thread. During the last phase, the workers send
//! load and save requests through a [TileLoaderQueue] which the calling thread executes.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ground_core::{nalgebra::Point3, source::{Channels, PointSource}};
use log::{debug, info, warn};

use crate::{
    accelerator::{Accelerator, AcceleratorDispatch},
    classifier::{PointVerdict, TileClassifier, TileVerdicts},
    densification::Densifier,
    error::{GroundDetectionError, Result},
    estimation::{estimate_thresholds, Thresholds},
    loader::{TileLoaderQueue, TileMessage, TileSlots, DEFAULT_BACKLOG},
    outliers::OutlierExcluder,
    params::GroundDetectionParameters,
    progress::{ProgressHook, ProgressMonitor, DEFAULT_UPDATE_INTERVAL},
    quadtree::{NodeId, Quadtree, SplitLimits},
    seeds::{Seed, SeedSelector},
    surface::Surface,
};

/// Upper bound for the number of classification workers
pub const MAX_WORKER_THREADS: usize = 8;
const PHASE_COUNT: usize = 4;

/// What a finished run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSummary {
    /// Number of leaves of the quadtree
    pub tiles: usize,
    /// Leaves with at least one visible point
    pub seed_tiles: usize,
    /// Seed points that made it into the ground surface, additional seed points included
    pub seed_points: usize,
    pub cleared_tiles: usize,
    pub removed_seed_points: usize,
    /// Triangles of the surface the points were classified against
    pub surface_triangles: usize,
    pub densification_iterations: usize,
    /// Points added to the surface by densification
    pub densified_points: usize,
    pub classified_tiles: usize,
    /// Tiles without a local triangulation, whose points were all classified as non-ground
    pub skipped_tiles: usize,
    pub ground_points: usize,
    pub non_ground_points: usize,
    /// The resolved thresholds. `None` if the source was empty
    pub thresholds: Option<Thresholds>,
    pub accelerator_fell_back: bool,
    pub workers: usize,
}

#[derive(Default)]
struct TileCounters {
    classified: AtomicUsize,
    skipped: AtomicUsize,
    ground: AtomicUsize,
    non_ground: AtomicUsize,
}

impl TileCounters {
    fn record(&self, verdicts: &TileVerdicts) {
        let ground = verdicts.count(PointVerdict::Ground);
        let untested = verdicts.count(PointVerdict::Invisible);
        self.ground.fetch_add(ground, Ordering::SeqCst);
        self.non_ground
            .fetch_add(verdicts.verdicts.len() - ground - untested, Ordering::SeqCst);
    }
}

/// Counts a worker as finished when it goes out of scope, also when the worker bails out early
struct FinishedGuard<'a>(&'a AtomicUsize);

impl Drop for FinishedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Classifies the points of a [PointSource] into ground and non-ground
pub struct GroundDetector {
    params: GroundDetectionParameters,
    accelerator: Option<Arc<dyn Accelerator>>,
    worker_count: Option<usize>,
    update_interval: Duration,
}

impl GroundDetector {
    pub fn new(params: GroundDetectionParameters) -> Self {
        Self {
            params,
            accelerator: None,
            worker_count: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    /// Uses `accelerator` for the per-point test instead of the one the processing strategy asks for
    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Fixes the number of classification workers
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers.max(1));
        self
    }

    /// Minimum time between two recomputations of the progress estimate handed to the hook
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn params(&self) -> &GroundDetectionParameters {
        &self.params
    }

    fn workers_for(&self, tiles: usize) -> usize {
        let workers = match self.worker_count {
            Some(workers) => workers,
            None if self.params.use_multithread => thread::available_parallelism()
                .map_or(1, |n| n.get())
                .min(MAX_WORKER_THREADS),
            None => 1,
        };
        workers.min(tiles).max(1)
    }

    fn dispatch(&self) -> AcceleratorDispatch {
        match &self.accelerator {
            Some(accelerator) => AcceleratorDispatch::new(Arc::clone(accelerator)),
            None => AcceleratorDispatch::for_strategy(self.params.processing_strategy),
        }
    }

    /// Runs the ground detection on all points of `source` and writes the classification back into it.
    ///
    /// `hook` is asked before every unit of work whether to go on. If it says no, the run stops as soon as
    /// all tiles that are in flight are written back and returns [GroundDetectionError::UserAborted]. Points
    /// of tiles that were not written back keep their previous class.
    pub fn run<S: PointSource + ?Sized>(
        &self,
        source: &mut S,
        hook: &dyn ProgressHook,
    ) -> Result<DetectionSummary> {
        let monitor = ProgressMonitor::new(hook, PHASE_COUNT).with_update_interval(self.update_interval);
        let mut summary = DetectionSummary::default();

        // Phase 1
        monitor.start_phase("Building quadtree", 1);
        let bounds = match source.bounds() {
            Some(bounds) => bounds,
            None => {
                warn!("Point source is empty, nothing to classify");
                monitor.end_phase();
                return Ok(summary);
            }
        };
        let limits = SplitLimits {
            tile_size: self.params.tile_size(),
            max_data_size: self.params.max_points_per_tile,
            max_depth: self.params.max_tree_depth,
        };
        let (mut tree, seed_tiles) = Quadtree::build(bounds, source, limits)?;
        summary.tiles = tree.leaves().count();
        summary.seed_tiles = seed_tiles.len();
        info!(
            "Quadtree: {} tiles, {} with visible points, depth {}",
            summary.tiles,
            summary.seed_tiles,
            tree.max_depth()
        );
        monitor.work_completed(1);
        monitor.end_phase();
        if !monitor.check_continue() {
            return Err(GroundDetectionError::UserAborted { tiles_completed: 0 });
        }

        // Phase 2
        monitor.start_phase("Selecting seeds", seed_tiles.len());
        let mut seeds = self.select_seeds(&tree, &seed_tiles, source, &monitor)?;
        monitor.end_phase();

        // Phase 3
        let densification_work = self.params.densification_iterations * seed_tiles.len();
        monitor.start_phase("Building ground surface", 1 + densification_work);
        let exclusion = OutlierExcluder::new(&self.params).exclude(&tree, &mut seeds);
        summary.cleared_tiles = exclusion.cleared_tiles;
        summary.removed_seed_points = exclusion.removed_points;

        let seed_points: Vec<Point3<f64>> = seeds
            .iter()
            .flat_map(|seed| seed.points().iter().copied())
            .chain(self.params.additional_seed_points.iter().copied())
            .collect();
        summary.seed_points = seed_points.len();
        let surface = Surface::triangulate(&seed_points);
        if surface.is_empty() {
            warn!(
                "Ground surface from {} seed points has no triangles, all points will be non-ground",
                seed_points.len()
            );
        }
        tree.index_triangles(&surface);
        let thresholds = estimate_thresholds(&surface, &self.params);
        info!(
            "Ground surface: {} triangles from {} seed points ({} removed as outliers)",
            surface.triangle_count(),
            summary.seed_points,
            summary.removed_seed_points
        );

        let (surface, thresholds) = if self.params.densification_iterations > 0 {
            let densified = Densifier::new(&self.params, &seed_tiles, &seeds).densify(
                &mut tree,
                source,
                seed_points,
                surface,
                thresholds,
                &monitor,
            )?;
            summary.densification_iterations = densified.summary.iterations;
            summary.densified_points = densified.summary.added_points;
            (densified.surface, densified.thresholds)
        } else {
            (surface, thresholds)
        };
        if let Some(extent) = surface.bounds() {
            debug!(
                "Ground surface spans {:?} - {:?}",
                extent.min(),
                extent.max()
            );
        }
        summary.surface_triangles = surface.triangle_count();
        summary.thresholds = Some(thresholds);
        monitor.work_completed(1);
        monitor.end_phase();
        if !monitor.check_continue() {
            return Err(GroundDetectionError::UserAborted { tiles_completed: 0 });
        }

        // Phase 4
        monitor.start_phase("Classifying tiles", seed_tiles.len());
        let workers = self.workers_for(seed_tiles.len());
        summary.workers = workers;
        let dispatch = self.dispatch();
        let classifier = TileClassifier::new(&tree, &surface, thresholds, &self.params);
        let counters = TileCounters::default();
        let finished = AtomicUsize::new(0);
        let slots = TileSlots::new(tree.len());
        let queue = TileLoaderQueue::new(&tree, &slots, DEFAULT_BACKLOG);
        queue.set_stop(|| finished.load(Ordering::SeqCst) >= workers);
        queue.set_on_failure(|| monitor.signal_error());
        info!("Classifying {} tiles on {} workers", seed_tiles.len(), workers);

        thread::scope(|scope| {
            for worker in 0..workers {
                let worker_ctx = Worker {
                    index: worker,
                    stride: workers,
                    tiles: &seed_tiles,
                    seeds: &seeds,
                    classifier: &classifier,
                    dispatch: &dispatch,
                    queue: &queue,
                    slots: &slots,
                    monitor: &monitor,
                    counters: &counters,
                };
                let finished = &finished;
                scope.spawn(move || {
                    let _guard = FinishedGuard(finished);
                    worker_ctx.run();
                });
            }
            queue.run(source);
        });
        monitor.end_phase();

        if let Some(why) = queue.take_failure() {
            return Err(GroundDetectionError::Source(why));
        }
        if monitor.has_error() {
            return Err(GroundDetectionError::Source(anyhow::anyhow!(
                "tile loader queue closed before all tiles were classified"
            )));
        }
        if monitor.is_cancelled() {
            let tiles_completed = monitor.work_done();
            warn!("Ground detection cancelled after {} tiles", tiles_completed);
            return Err(GroundDetectionError::UserAborted { tiles_completed });
        }

        summary.classified_tiles = counters.classified.load(Ordering::SeqCst);
        summary.skipped_tiles = counters.skipped.load(Ordering::SeqCst);
        summary.ground_points = counters.ground.load(Ordering::SeqCst);
        summary.non_ground_points = counters.non_ground.load(Ordering::SeqCst);
        summary.accelerator_fell_back = dispatch.has_fallen_back();
        info!(
            "Classified {} tiles: {} ground, {} non-ground points",
            summary.classified_tiles, summary.ground_points, summary.non_ground_points
        );
        Ok(summary)
    }

    fn select_seeds<S: PointSource + ?Sized>(
        &self,
        tree: &Quadtree,
        seed_tiles: &[NodeId],
        source: &mut S,
        monitor: &ProgressMonitor,
    ) -> Result<Vec<Seed>> {
        let selector = SeedSelector::new(&self.params, tree.max_depth());
        let mut seeds = Vec::with_capacity(seed_tiles.len());
        for tile in seed_tiles {
            if !monitor.check_continue() {
                return Err(GroundDetectionError::UserAborted { tiles_completed: 0 });
            }
            let node = tree.node(*tile);
            let buffer = source.query_points(node.region(), Channels::GEOMETRY)?;
            seeds.push(selector.select(*tile, node, &buffer));
            monitor.work_completed(1);
        }
        Ok(seeds)
    }
}

/// Everything one classification worker shares with the others
struct Worker<'w, 'a> {
    index: usize,
    stride: usize,
    tiles: &'w [NodeId],
    seeds: &'w [Seed],
    classifier: &'w TileClassifier<'a>,
    dispatch: &'w AcceleratorDispatch,
    queue: &'w TileLoaderQueue<'a>,
    slots: &'w TileSlots,
    monitor: &'w ProgressMonitor<'a>,
    counters: &'w TileCounters,
}

impl Worker<'_, '_> {
    /// Classifies every `stride`-th tile, starting at `index`
    fn run(&self) {
        for (idx, tile) in self
            .tiles
            .iter()
            .enumerate()
            .skip(self.index)
            .step_by(self.stride)
        {
            if !self.monitor.check_continue() {
                break;
            }
            if self.queue.send(TileMessage::Load(*tile)).is_err() {
                self.monitor.signal_error();
                break;
            }
            let mut buffer = match self.slots.wait_for(*tile) {
                Some(buffer) => buffer,
                None => {
                    self.monitor.signal_error();
                    break;
                }
            };

            let verdicts = match self.classifier.prepare(*tile, self.seeds.get(idx)) {
                Ok(context) => {
                    self.counters.classified.fetch_add(1, Ordering::SeqCst);
                    self.classifier.classify(&context, &buffer, self.dispatch)
                }
                Err(why) => {
                    warn!("{}, classifying its points as non-ground", why);
                    self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                    TileClassifier::unresolved(&buffer)
                }
            };
            verdicts.apply(&mut buffer);
            self.counters.record(&verdicts);

            self.slots.put(*tile, buffer);
            if self.queue.send(TileMessage::Save(*tile)).is_err() {
                self.monitor.signal_error();
                break;
            }
            self.monitor.work_completed(1);
        }
    }
}
