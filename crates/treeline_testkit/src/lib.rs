//! # Treeline Testkit
//!
//! Test utilities for Treeline.
//!
//! This crate provides:
//! - Client fixtures backed by the in-memory engine
//! - Property-based generators for names, subscripts and values
//! - Stress runs for concurrent transactions, increments and cursors
//! - ZWRITE and collation test vectors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use treeline_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_conn() {
//!     with_conn(|conn| {
//!         conn.node("^hello", &["world"]).unwrap().set("Go world").unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use crate::vectors::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
pub use vectors::*;
