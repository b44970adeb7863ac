//! # Treeline Engine
//!
//! The native engine surface consumed by `treeline_client`.
//!
//! This crate provides:
//! - Fixed-layout buffer descriptors and the variadic parameter block
//! - Status codes and the engine message table
//! - The [`Engine`] trait, one method per native entry point
//! - M numeric coercion shared by engines and clients
//! - [`MemoryEngine`], an in-memory reference engine for tests and benches

#![warn(missing_docs)]

mod abi;
mod engine;
pub mod memory;
pub mod numeric;
pub mod status;

pub use abi::{
    BufferDesc, DeleteKind, ParamBlock, TpFn, VariadicEntry, MAX_ERRORMSG, MAX_NAMES, MAX_PARAMS,
    MAX_STR, MAX_SUBSCRIPTS, MAX_TIME_NS, MAX_VARNAME_LEN, NOTTP,
};
pub use engine::Engine;
pub use memory::{MemoryEngine, MemoryEngineConfig, Routine};
