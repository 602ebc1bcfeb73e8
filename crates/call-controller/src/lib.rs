//! Call Controller Library
//!
//! Core of the Parley calling backend:
//!
//! - Call session lifecycle (ringing, active, ended) for 1:1 and group calls
//! - Per-participant status with compare-and-set transitions
//! - SFU router placement across a fixed media worker pool
//! - Full-mesh transport wiring per call
//! - Call records persisted once per ended call
//!
//! # Architecture
//!
//! ```text
//! CallControllerActor (singleton)
//! └── CallSessionActor (one per call)
//!     ├── CallSession (pure state machine)
//!     └── MediaPipeline ──▶ RouterRegistry ──▶ MediaEngine
//!                               └── WorkerPool
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Controller and per-call actors
//! - [`session`] - Call and participant state machine
//! - [`media`] - Worker pool, router registry, media engine seam
//! - [`record`] - Call record derivation
//! - [`store`] - Call record persistence seam
//! - [`signaling`] - Gateway event types
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`observability`] - Metrics and health endpoints

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod record;
pub mod session;
pub mod signaling;
pub mod store;
