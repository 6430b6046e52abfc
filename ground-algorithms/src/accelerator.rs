use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use ground_core::nalgebra::Point3;
use log::{info, warn};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    classifier::{evaluate_point_indexed, PointTestParams, PointVerdict},
    error::{GroundDetectionError, Result},
    params::ProcessingStrategy,
    quadtree::NodeId,
    surface::TriangleIndex,
};

/// An executor for the per-point ground test.
///
/// Implementations must return exactly one verdict per point, in the order of `points`, and must compute
/// each verdict with [evaluate_point](crate::classifier::evaluate_point) or [evaluate_point_indexed].
pub trait Accelerator: Send + Sync {
    /// Human readable name of the device, used in log messages
    fn name(&self) -> &str;

    /// Tests all `points` against `triangles`
    fn evaluate(
        &self,
        points: &[Point3<f64>],
        triangles: &[[Point3<f64>; 3]],
        params: &PointTestParams,
    ) -> Result<Vec<PointVerdict>>;
}

/// Evaluates points one after another on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuAccelerator;

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn evaluate(
        &self,
        points: &[Point3<f64>],
        triangles: &[[Point3<f64>; 3]],
        params: &PointTestParams,
    ) -> Result<Vec<PointVerdict>> {
        let index = TriangleIndex::new(triangles);
        Ok(points
            .iter()
            .map(|p| evaluate_point_indexed(p, triangles, &index, params))
            .collect())
    }
}

/// Evaluates points as a data-parallel batch, one lane per point, on a dedicated thread pool
pub struct ParallelAccelerator {
    pool: ThreadPool,
    name: String,
}

impl ParallelAccelerator {
    /// Creates an accelerator with `lanes` worker threads
    pub fn new(lanes: usize) -> Result<Self> {
        let lanes = lanes.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(lanes)
            .thread_name(|idx| format!("ground-lane-{}", idx))
            .build()
            .map_err(|why| GroundDetectionError::AcceleratorFault {
                device: format!("parallel[{}]", lanes),
                reason: why.to_string(),
            })?;
        Ok(Self {
            pool,
            name: format!("parallel[{}]", lanes),
        })
    }

    /// Number of lanes the processing strategy asks for
    pub fn lanes_for(strategy: ProcessingStrategy) -> usize {
        let available = thread::available_parallelism().map_or(1, |n| n.get());
        match strategy {
            ProcessingStrategy::Cpu => 1,
            ProcessingStrategy::AnyAccelerator => available,
            ProcessingStrategy::NonDisplayAccelerator => available.saturating_sub(1).max(1),
        }
    }
}

impl Accelerator for ParallelAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        points: &[Point3<f64>],
        triangles: &[[Point3<f64>; 3]],
        params: &PointTestParams,
    ) -> Result<Vec<PointVerdict>> {
        let index = TriangleIndex::new(triangles);
        Ok(self.pool.install(|| {
            points
                .par_iter()
                .map(|p| evaluate_point_indexed(p, triangles, &index, params))
                .collect()
        }))
    }
}

/// Routes tile evaluations to an accelerator and falls back to the CPU when the accelerator fails.
///
/// Calls into the accelerator are serialized. After the first fault, the failing tile is evaluated again
/// on the CPU and the accelerator is not used for the rest of the run.
pub struct AcceleratorDispatch {
    primary: Option<Mutex<Arc<dyn Accelerator>>>,
    fallback: CpuAccelerator,
    faulted: AtomicBool,
    accelerated_tiles: AtomicUsize,
}

impl AcceleratorDispatch {
    /// A dispatcher that sends every tile to `primary` first
    pub fn new(primary: Arc<dyn Accelerator>) -> Self {
        Self {
            primary: Some(Mutex::new(primary)),
            fallback: CpuAccelerator,
            faulted: AtomicBool::new(false),
            accelerated_tiles: AtomicUsize::new(0),
        }
    }

    /// A dispatcher that only uses the CPU
    pub fn cpu() -> Self {
        Self {
            primary: None,
            fallback: CpuAccelerator,
            faulted: AtomicBool::new(false),
            accelerated_tiles: AtomicUsize::new(0),
        }
    }

    /// Creates the dispatcher for a processing strategy. If the accelerator cannot be created, the
    /// dispatcher starts out on the CPU
    pub fn for_strategy(strategy: ProcessingStrategy) -> Self {
        if strategy == ProcessingStrategy::Cpu {
            return Self::cpu();
        }
        match ParallelAccelerator::new(ParallelAccelerator::lanes_for(strategy)) {
            Ok(accelerator) => {
                info!("Using accelerator {}", accelerator.name());
                Self::new(Arc::new(accelerator))
            }
            Err(why) => {
                warn!("{}, using the CPU instead", why);
                let dispatch = Self::cpu();
                dispatch.faulted.store(true, Ordering::SeqCst);
                dispatch
            }
        }
    }

    /// True if an accelerator fault forced this dispatcher onto the CPU
    pub fn has_fallen_back(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Number of tiles evaluated by the accelerator
    pub fn accelerated_tiles(&self) -> usize {
        self.accelerated_tiles.load(Ordering::SeqCst)
    }

    /// Evaluates the points of `tile`. Never fails: accelerator faults are answered with a CPU evaluation
    pub fn evaluate(
        &self,
        tile: NodeId,
        points: &[Point3<f64>],
        triangles: &[[Point3<f64>; 3]],
        params: &PointTestParams,
    ) -> Vec<PointVerdict> {
        if let Some(primary) = self.primary.as_ref().filter(|_| !self.has_fallen_back()) {
            let outcome = match primary.lock() {
                Ok(accelerator) => accelerator
                    .evaluate(points, triangles, params)
                    .and_then(|verdicts| check_len(&**accelerator, verdicts, points.len())),
                Err(_) => Err(GroundDetectionError::AcceleratorFault {
                    device: "accelerator".into(),
                    reason: "dispatch lock poisoned".into(),
                }),
            };
            match outcome {
                Ok(verdicts) => {
                    self.accelerated_tiles.fetch_add(1, Ordering::SeqCst);
                    return verdicts;
                }
                Err(why) => {
                    if !self.faulted.swap(true, Ordering::SeqCst) {
                        warn!(
                            "{} while classifying tile {}, continuing on the CPU",
                            why,
                            tile.index()
                        );
                    }
                }
            }
        }
        // The CPU path cannot fail
        self.fallback
            .evaluate(points, triangles, params)
            .unwrap_or_default()
    }
}

fn check_len(
    accelerator: &dyn Accelerator,
    verdicts: Vec<PointVerdict>,
    expected: usize,
) -> Result<Vec<PointVerdict>> {
    if verdicts.len() != expected {
        return Err(GroundDetectionError::AcceleratorFault {
            device: accelerator.name().to_owned(),
            reason: format!("returned {} verdicts for {} points", verdicts.len(), expected),
        });
    }
    Ok(verdicts)
}
