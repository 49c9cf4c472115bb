pub mod calibration;
pub mod classifier;
pub mod movement;
pub mod pipeline;
pub mod signal_config;
pub mod signals;
pub mod verifier;

pub use calibration::{CalibrationParams, Calibrator};
pub use pipeline::{SignalEngine, SnapshotInput};
pub use signals::{LineMovementSignals, SignalProvider};
