//! Actor model implementation for the Call Controller.
//!
//! ```text
//! CallControllerActor (singleton per controller instance)
//! └── supervises N CallSessionActors
//!     └── CallSessionActor (one per live call)
//!         ├── owns the CallSession state machine
//!         └── feeds one MediaPipeline task (router attach/detach/release)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One mailbox per call**: transitions of one call are serialized; calls run in parallel
//! - **CancellationToken propagation**: the controller hands each session a child token
//! - **Mailbox monitoring**: depth thresholds with metrics (Controller: 100/500, Call: 16/48)
//! - **Media off the mailbox**: sessions enqueue media work and never await the engine
//!
//! # Modules
//!
//! - [`controller`] - `CallControllerActor` singleton that supervises calls
//! - [`call`] - `CallSessionActor` per live call
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod call;
pub mod controller;
pub mod messages;
pub mod metrics;

pub use call::{CallSessionActor, CallSessionHandle, SessionContext};
pub use controller::{CallControllerActor, CallControllerHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, DepthBands, MailboxLevel, MailboxMonitor};
