use thiserror::Error;

/// Everything that can go wrong during a ground detection run.
///
/// Only [UserAborted](GroundDetectionError::UserAborted) and [Source](GroundDetectionError::Source) end a
/// run. The other kinds are recovered from locally: the affected tile is logged and left non-ground.
#[derive(Debug, Error)]
pub enum GroundDetectionError {
    #[error("Ground detection was cancelled after {tiles_completed} tiles")]
    UserAborted { tiles_completed: usize },
    #[error("Region of tile {tile} contains no {what}")]
    EmptyRegion { tile: usize, what: &'static str },
    #[error("Accelerator {device} failed: {reason}")]
    AcceleratorFault { device: String, reason: String },
    #[error("Degenerate statistics in tile {tile}: {reason}")]
    DegenerateStatistics { tile: usize, reason: String },
    #[error("Invalid ground detection configuration: {0}")]
    Configuration(String),
    #[error("Point source failed")]
    Source(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GroundDetectionError>;
