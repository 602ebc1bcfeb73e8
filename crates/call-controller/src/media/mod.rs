//! Media routing topology.
//!
//! The call controller never talks to an SFU directly. Everything below the
//! [`MediaEngine`] seam is engine-specific; everything above it only deals in
//! opaque router/transport/consumer IDs.
//!
//! ```text
//! RouterRegistry (arena: CallId -> RouterEntry)
//! ├── WorkerPool (least-loaded placement)
//! └── MediaEngine (create/connect/close)
//!
//! MediaPipeline (one per call, ordered Attach/Detach/Release)
//! ```
//!
//! # Modules
//!
//! - [`engine`] - `MediaEngine` capability trait, shared media types, mock engine
//! - [`in_process`] - bookkeeping engine used when no external SFU is wired in
//! - [`worker_pool`] - fixed pool of media workers with least-loaded placement
//! - [`router_registry`] - per-call router arena and transport fan-out
//! - [`pipeline`] - per-call executor that serializes media work off the session path

pub mod engine;
pub mod in_process;
pub mod pipeline;
pub mod router_registry;
pub mod worker_pool;

use std::fmt;
use thiserror::Error;

pub use engine::{
    CodecCapability, ConsumerId, MediaEngine, MediaKind, RouterId, TransportDirection,
    TransportId,
};
pub use in_process::InProcessEngine;
pub use pipeline::{MediaCommand, MediaPipeline, MediaPipelineHandle};
pub use router_registry::{AttachOutcome, RouterHandle, RouterRegistry};
pub use worker_pool::{WorkerLoad, WorkerPool};

/// Index of a media worker in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Errors raised below the media seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Every worker is unreachable or at its router cap.
    #[error("no media worker available")]
    NoWorkerAvailable,

    /// The engine could not reach a specific worker.
    #[error("{0} unreachable")]
    WorkerUnreachable(WorkerId),

    /// No router is registered for the call.
    #[error("router not found: {0}")]
    RouterNotFound(String),

    /// The router was released; no new transports may be attached.
    #[error("router already released: {0}")]
    RouterReleased(String),

    /// Transport port range exhausted.
    #[error("transport port range exhausted")]
    PortsExhausted,

    /// Any other engine failure.
    #[error("media engine error: {0}")]
    Engine(String),
}
