//! Pipeline lifecycle, beamforming stage and fault handling.
//!
//! # Architecture
//!
//! ```text
//!            ┌───────────── FaultController (global state, watchdog) ─────────────┐
//!            │                        ▲ report_error / ping                       │
//!            ▼                        │                                           ▼
//! capture stage ─▶ SampleChannel ─▶ BeamformingEngine ─▶ SampleChannel ─▶ output stage
//! (RecoverableDevice)               (FrameProcessor)                     (RecoverableDevice)
//! ```
//!
//! [`BeamformerPipeline`] owns everything above and exposes the lifecycle:
//! `init`, `start`, `stop`, `state`, `current_angle` and `restart`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mic_beamformer::config::BeamformerConfig;
//! use mic_beamformer::device::CpalDriver;
//! use mic_beamformer::pipeline::BeamformerPipeline;
//!
//! let config = BeamformerConfig::load().unwrap();
//! let mut pipeline = BeamformerPipeline::new(config, Arc::new(CpalDriver::new())).unwrap();
//! pipeline.start().unwrap();
//!
//! let shutdown = AtomicBool::new(false);
//! pipeline.run_until(&shutdown, Duration::from_secs(5));
//! pipeline.stop();
//! ```

pub mod engine;
pub mod fault;
pub mod runner;
pub mod stage;
pub mod state;
mod watchdog;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use engine::{estimator_from_config, BeamformingEngine, FrameProcessor};
pub use fault::FaultController;
pub use runner::{BeamformerPipeline, PipelineError};
pub use stage::{Stage, StageShared};
pub use state::{AppState, FaultKind, StateCell};
