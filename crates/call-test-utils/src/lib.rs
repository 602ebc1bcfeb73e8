//! # Call Test Utilities
//!
//! Shared test utilities for the Call Controller.
//!
//! - `fixtures` - Configuration, user and `InitiateCall` builders
//! - `harness` - A controller over mock media and storage, event collection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let t = TestController::start(&TestConfig::new().build());
//!     let mut events = EventCollector::new(t.controller.subscribe());
//!
//!     let snap = t
//!         .controller
//!         .initiate_call(TestCall::audio("alice", &["bob"]).build())
//!         .await
//!         .unwrap();
//!     t.controller.reject(snap.call_id, user("bob")).await.unwrap();
//!
//!     events.wait_for_end(snap.call_id).await;
//!     let record = t.wait_for_record(snap.call_id).await;
//!     assert!(record.missed);
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
