//! Benchmark utilities.

use rand::Rng;
use std::sync::Arc;
use treeline_client::{Client, ClientConfig, Conn};
use treeline_engine::MemoryEngine;

/// Generate random value bytes of the specified size.
pub fn random_value(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Create a client over a fresh in-memory engine.
pub fn memory_client() -> Client {
    Client::init(Arc::new(MemoryEngine::new()), ClientConfig::default())
}

/// Write `count` children under `varname`, subscripted `0..count`.
pub fn populate_children(conn: &Conn, varname: &str, count: usize) {
    for i in 0..count {
        conn.node(varname, &[i.to_string()])
            .and_then(|node| node.set("x"))
            .expect("Failed to populate");
    }
}
