//! # Treeline Client
//!
//! Safe access layer over a native hierarchical key-value engine.
//!
//! This crate provides:
//! - [`NativeBuffer`] and [`BufferSet`], owned handles to native byte buffers
//! - [`Key`], the low-level address of a node (variable name plus subscripts)
//! - The capacity-retry protocol for engine-sized results
//! - [`Node`], a high-level path with sibling and depth-first navigation
//!   and an allocation-free mutable cursor
//! - Variadic engine calls (multi-lock, call-in) through an explicit
//!   parameter block
//! - Transactions that run Rust closures inside the engine
//!
//! ## Ownership
//!
//! Buffers, sets and nodes own their native memory and free it on drop.
//! A [`Conn`] is the per-thread context every call goes through; it is
//! `Send` but not `Sync`, so each thread works through its own connection.
//! Nodes borrow their connection, and a cursor yielded by
//! [`Children::advance`] borrows the iterator, so a cursor cannot be
//! retained past the next step.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use treeline_client::{Client, ClientConfig};
//! use treeline_engine::MemoryEngine;
//!
//! let client = Client::init(Arc::new(MemoryEngine::new()), ClientConfig::default());
//! let conn = client.conn();
//!
//! let hello = conn.node("^hello", &["world"])?;
//! hello.set("Go world")?;
//! assert_eq!(hello.get()?, b"Go world");
//! assert_eq!(hello.to_string(), "^hello(\"world\")");
//! # Ok::<(), treeline_client::ClientError>(())
//! ```

#![warn(missing_docs)]

mod block;
mod buffer;
mod buffer_set;
mod client;
mod config;
mod conn;
mod cursor;
mod error;
mod key;
mod node;
mod retry;
mod transaction;
mod variadic;

pub use buffer::NativeBuffer;
pub use buffer_set::BufferSet;
pub use client::{Client, ShutdownReason};
pub use config::ClientConfig;
pub use conn::Conn;
pub use cursor::{Children, Tree};
pub use error::{codes, ClientError, ClientResult};
pub use key::Key;
pub use node::Node;
pub use transaction::TxnOutcome;
pub use treeline_engine::DeleteKind;
