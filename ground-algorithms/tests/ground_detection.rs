use std::sync::Arc;

use common::{flat_grid, is_building, terrain_with_building, ReadOnlySource, TERRAIN_SIZE};
use ground_algorithms::{
    accelerator::Accelerator,
    classifier::{PointTestParams, PointVerdict},
    detector::{DetectionSummary, GroundDetector},
    params::{GroundDetectionParameters, ProcessingStrategy, Threshold},
    progress::{NoProgress, ProgressSnapshot},
    GroundDetectionError,
};
use ground_core::{
    classification::PointClass,
    nalgebra::Point3,
    source::InMemoryPointSource,
};

mod common;

fn tiled_params() -> GroundDetectionParameters {
    GroundDetectionParameters::default()
        .with_max_structure_size(10.0)
        .with_max_points_per_tile(100)
}

fn classify(
    points: Vec<Point3<f64>>,
    detector: &GroundDetector,
) -> (InMemoryPointSource, DetectionSummary) {
    let mut source = InMemoryPointSource::new(points);
    let summary = detector
        .run(&mut source, &NoProgress)
        .expect("ground detection failed");
    (source, summary)
}

#[test]
fn test_flat_grid_is_ground() {
    let (source, summary) = classify(
        flat_grid(10),
        &GroundDetector::new(GroundDetectionParameters::default().with_max_structure_size(20.0)),
    );
    assert_eq!(summary.tiles, 1);
    assert_eq!(summary.seed_tiles, 1);
    assert!(summary.seed_points >= 3);
    assert!(summary.surface_triangles >= 1);
    assert_eq!(summary.ground_points, 100);
    assert_eq!(summary.non_ground_points, 0);
    assert!(source.classification().iter().all(|c| *c == PointClass::Ground));
}

#[test]
fn test_raised_point_is_not_ground() {
    let mut points = flat_grid(10);
    let raised = 5 * 10 + 5;
    points[raised].z = 50.0;
    for params in [
        GroundDetectionParameters::default(),
        GroundDetectionParameters::default().with_height_threshold(Threshold::Value(1.0)),
    ] {
        let (source, summary) = classify(points.clone(), &GroundDetector::new(params));
        assert_eq!(summary.non_ground_points, 1);
        for (idx, class) in source.classification().iter().enumerate() {
            if idx == raised {
                assert_eq!(*class, PointClass::NonGround);
            } else {
                assert_eq!(*class, PointClass::Ground, "point {} should be ground", idx);
            }
        }
    }
}

#[test]
fn test_invisible_points_keep_their_class() {
    let points = flat_grid(10);
    let visibility: Vec<bool> = (0..points.len()).map(|i| i % 7 != 0).collect();
    let mut source = InMemoryPointSource::with_visibility(points, visibility.clone()).unwrap();
    let summary = GroundDetector::new(GroundDetectionParameters::default())
        .run(&mut source, &NoProgress)
        .unwrap();
    assert_eq!(
        summary.ground_points,
        visibility.iter().filter(|v| **v).count()
    );
    for (class, visible) in source.classification().iter().zip(&visibility) {
        if *visible {
            assert_eq!(*class, PointClass::Ground);
        } else {
            assert_eq!(*class, PointClass::NeverClassified);
        }
    }
}

#[test]
fn test_every_tile_is_classified_once() {
    let (source, summary) = classify(terrain_with_building(), &GroundDetector::new(tiled_params()));
    assert_eq!(summary.tiles, 16);
    assert_eq!(summary.seed_tiles, 16);
    assert_eq!(summary.classified_tiles + summary.skipped_tiles, 16);
    assert_eq!(
        summary.ground_points + summary.non_ground_points,
        TERRAIN_SIZE * TERRAIN_SIZE
    );

    let mut submitted = source.submitted_tiles().to_vec();
    submitted.sort_unstable();
    submitted.dedup();
    assert_eq!(submitted.len(), 16);
    assert_eq!(source.submitted_tiles().len(), 16);
    assert!(source
        .classification()
        .iter()
        .all(|c| *c != PointClass::NeverClassified));
}

#[test]
fn test_building_is_not_ground() {
    let (source, summary) = classify(terrain_with_building(), &GroundDetector::new(tiled_params()));
    for (pos, class) in source.positions().iter().zip(source.classification()) {
        if is_building(pos.x, pos.y) {
            assert_eq!(*class, PointClass::NonGround, "roof point {:?}", pos);
        }
    }
    assert!(summary.ground_points > summary.non_ground_points);
}

#[test]
fn test_result_does_not_depend_on_worker_count() {
    let (single, _) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params()).with_worker_count(1),
    );
    let (many, summary) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params()).with_worker_count(4),
    );
    assert_eq!(summary.workers, 4);
    assert_eq!(single.classification(), many.classification());
}

#[test]
fn test_cpu_and_accelerator_agree() {
    let (cpu, _) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params().with_processing_strategy(ProcessingStrategy::Cpu)),
    );
    let (accelerated, summary) = classify(
        terrain_with_building(),
        &GroundDetector::new(
            tiled_params().with_processing_strategy(ProcessingStrategy::AnyAccelerator),
        ),
    );
    assert!(!summary.accelerator_fell_back);
    assert_eq!(cpu.classification(), accelerated.classification());
}

struct FailingAccelerator;

impl Accelerator for FailingAccelerator {
    fn name(&self) -> &str {
        "failing"
    }

    fn evaluate(
        &self,
        _points: &[Point3<f64>],
        _triangles: &[[Point3<f64>; 3]],
        _params: &PointTestParams,
    ) -> ground_algorithms::Result<Vec<PointVerdict>> {
        Err(GroundDetectionError::AcceleratorFault {
            device: "failing".into(),
            reason: "lost device".into(),
        })
    }
}

#[test]
fn test_accelerator_fault_falls_back_to_cpu() {
    let (cpu, _) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params().with_processing_strategy(ProcessingStrategy::Cpu)),
    );
    let (fallback, summary) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params()).with_accelerator(Arc::new(FailingAccelerator)),
    );
    assert!(summary.accelerator_fell_back);
    assert_eq!(summary.classified_tiles + summary.skipped_tiles, 16);
    assert_eq!(cpu.classification(), fallback.classification());
}

#[test]
fn test_larger_height_threshold_keeps_ground() {
    let mut previous: Option<Vec<PointClass>> = None;
    for height in [0.05, 0.2, 1.0, 10.0] {
        let params = tiled_params()
            .with_slope_threshold(Threshold::Value(20.0))
            .with_height_threshold(Threshold::Value(height));
        let (source, _) = classify(terrain_with_building(), &GroundDetector::new(params));
        let current = source.classification().to_vec();
        if let Some(previous) = previous {
            for (before, now) in previous.iter().zip(&current) {
                assert!(!before.is_ground() || now.is_ground());
            }
        }
        previous = Some(current);
    }
}

#[test]
fn test_running_twice_gives_the_same_result() {
    let detector = GroundDetector::new(tiled_params());
    let mut source = InMemoryPointSource::new(terrain_with_building());
    let first_summary = detector.run(&mut source, &NoProgress).unwrap();
    let first = source.classification().to_vec();
    let second_summary = detector.run(&mut source, &NoProgress).unwrap();
    assert_eq!(first, source.classification());
    assert_eq!(first_summary, second_summary);
}

#[test]
fn test_cancellation_writes_back_finished_tiles_only() {
    let stop_after = 3;
    let hook = move |snapshot: &ProgressSnapshot| !(snapshot.phase == 4 && snapshot.work_done >= stop_after);
    let mut source = InMemoryPointSource::new(terrain_with_building());
    let result = GroundDetector::new(tiled_params())
        .with_worker_count(1)
        .run(&mut source, &hook);

    match result {
        Err(GroundDetectionError::UserAborted { tiles_completed }) => {
            assert_eq!(tiles_completed, stop_after)
        }
        other => panic!("expected a cancelled run, got {:?}", other),
    }
    assert_eq!(source.submitted_tiles().len(), stop_after);
    let classified = source
        .classification()
        .iter()
        .filter(|c| **c != PointClass::NeverClassified)
        .count();
    assert!(classified > 0);
    assert!(classified < TERRAIN_SIZE * TERRAIN_SIZE);
}

#[test]
fn test_cancel_before_classification() {
    let hook = |snapshot: &ProgressSnapshot| snapshot.phase < 2;
    let mut source = InMemoryPointSource::new(flat_grid(10));
    let result = GroundDetector::new(GroundDetectionParameters::default()).run(&mut source, &hook);
    assert!(matches!(
        result,
        Err(GroundDetectionError::UserAborted { tiles_completed: 0 })
    ));
    assert!(source.submitted_tiles().is_empty());
    assert!(source
        .classification()
        .iter()
        .all(|c| *c == PointClass::NeverClassified));
}

#[test]
fn test_empty_source() {
    let (_, summary) = classify(vec![], &GroundDetector::new(GroundDetectionParameters::default()));
    assert_eq!(summary, DetectionSummary::default());
}

#[test]
fn test_source_errors_end_the_run() {
    let mut source = ReadOnlySource::new(InMemoryPointSource::new(flat_grid(10)));
    let result = GroundDetector::new(GroundDetectionParameters::default()).run(&mut source, &NoProgress);
    assert!(matches!(result, Err(GroundDetectionError::Source(_))));
}

#[test]
fn test_failed_save_stops_new_tiles() {
    let mut source = ReadOnlySource::new(InMemoryPointSource::new(terrain_with_building()));
    let result = GroundDetector::new(tiled_params())
        .with_worker_count(1)
        .run(&mut source, &NoProgress);
    assert!(matches!(result, Err(GroundDetectionError::Source(_))));
    // The tile that was loaded while the first save failed is still finished
    assert!((1..=2).contains(&source.rejected), "{} tiles saved", source.rejected);
}

#[test]
fn test_densification_grows_the_surface() {
    let (_, plain) = classify(terrain_with_building(), &GroundDetector::new(tiled_params()));
    let (single, dense) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params().with_densification(3)).with_worker_count(1),
    );
    assert!(dense.densification_iterations >= 1);
    assert!(dense.densified_points > 0);
    assert_eq!(dense.seed_points, plain.seed_points);
    assert!(dense.surface_triangles > plain.surface_triangles);
    assert_eq!(
        dense.ground_points + dense.non_ground_points,
        TERRAIN_SIZE * TERRAIN_SIZE
    );
    for (pos, class) in single.positions().iter().zip(single.classification()) {
        if is_building(pos.x, pos.y) {
            assert_eq!(*class, PointClass::NonGround, "roof point {:?}", pos);
        }
    }

    let (many, _) = classify(
        terrain_with_building(),
        &GroundDetector::new(tiled_params().with_densification(3)).with_worker_count(4),
    );
    assert_eq!(single.classification(), many.classification());
}

#[test]
fn test_additional_seed_points() {
    let (_, plain) = classify(
        flat_grid(10),
        &GroundDetector::new(GroundDetectionParameters::default()),
    );
    let extra = vec![Point3::new(-5.0, -5.0, 0.0), Point3::new(15.0, 15.0, 0.0)];
    let (source, with_extra) = classify(
        flat_grid(10),
        &GroundDetector::new(GroundDetectionParameters::default().with_additional_seed_points(extra)),
    );
    assert_eq!(with_extra.seed_points, plain.seed_points + 2);
    assert!(source.classification().iter().all(|c| c.is_ground()));
}

#[test]
fn test_override_string() {
    let params = GroundDetectionParameters::default().with_override_string("10 auto 15 0 cpu false");
    assert_eq!(params.slope_threshold, Threshold::Value(10.0));
    assert!(params.height_threshold.is_auto());
    assert_eq!(params.max_structure_size, 15.0);
    assert_eq!(params.processing_strategy, ProcessingStrategy::Cpu);
    assert!(!params.use_multithread);

    let unchanged = params.clone().with_override_string("10 auto");
    assert_eq!(unchanged, params);

    let (source, summary) = classify(flat_grid(10), &GroundDetector::new(params));
    assert_eq!(summary.workers, 1);
    assert!(source.classification().iter().all(|c| c.is_ground()));
}
