//! # growsync testkit
//!
//! Test utilities for growsync.
//!
//! This crate provides:
//! - Fixtures: servers, devices, row builders and temporary snapshots
//! - Property-based test generators using proptest
//! - An in-process transport that calls the server without a codec
//! - A multi-device harness that checks replicas converge on the server
//!
//! ## Usage
//!
//! ```rust,ignore
//! use growsync_testkit::prelude::*;
//!
//! #[test]
//! fn two_devices_converge() {
//!     let mut harness = SyncHarness::new(2);
//!     harness.create_plant(0, "Basil");
//!     harness.sync_all();
//!     harness.assert_converged();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::transport::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
pub use transport::*;
