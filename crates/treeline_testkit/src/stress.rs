//! Stress tests for Treeline.
//!
//! These runs exercise the client under heavy load and concurrent access.
//! Concurrent runs give every thread its own [`Conn`].

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use treeline_client::{Client, ClientResult, Conn, TxnOutcome};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Size of stored values in bytes.
    pub value_size: usize,
    /// Number of distinct nodes.
    pub node_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            value_size: 256,
            node_count: 1_000,
        }
    }
}

fn tally(result: ClientResult<()>, successful: &AtomicUsize, failed: &AtomicUsize) {
    match result {
        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
    };
}

/// Run a sequential set/get stress test under `^stress`.
pub fn stress_sequential_values(conn: &Conn, config: &StressConfig) -> StressTestResult {
    let value = vec![b'v'; config.value_size];
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let start = Instant::now();
    for i in 0..config.operations {
        let result = conn.node("^stress", &[(i % config.node_count).to_string()]).and_then(|node| {
            node.set(&value)?;
            if node.get()?.len() == value.len() {
                Ok(())
            } else {
                Err(treeline_client::ClientError::protocol_violation("value length changed"))
            }
        });
        tally(result, &successful, &failed);
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a concurrent increment stress test on `^counter`.
///
/// Every successful operation adds one, so afterwards `^counter` equals
/// the number of successful operations.
pub fn stress_concurrent_increments(client: Arc<Client>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads;

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let client = Arc::clone(&client);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let conn = client.conn();
                for _ in 0..ops_per_thread {
                    let result = conn.var("^counter").and_then(|node| node.incr("1").map(drop));
                    tally(result, &successful, &failed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    debug!(total = result.total_ops, "concurrent increments done");
    result
}

/// Run a concurrent transfer stress test over `^acct(0..node_count)`.
///
/// Each operation is a transaction moving one unit between two random
/// accounts, so the total balance is unchanged by any number of
/// successful or failed operations. Accounts must already exist.
pub fn stress_concurrent_transfers(client: Arc<Client>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads;
    let accounts = config.node_count.max(2);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let client = Arc::clone(&client);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let conn = client.conn();
                let mut rng = rand::thread_rng();
                for _ in 0..ops_per_thread {
                    let from = rng.gen_range(0..accounts).to_string();
                    let to = rng.gen_range(0..accounts).to_string();
                    let result = conn
                        .transaction("transfer", &[], |txn| {
                            txn.node("^acct", &[from.as_str()])?.incr("-1")?;
                            txn.node("^acct", &[to.as_str()])?.incr("1")?;
                            Ok(TxnOutcome::Commit)
                        })
                        .map(drop);
                    tally(result, &successful, &failed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    debug!(total = result.total_ops, "concurrent transfers done");
    result
}

/// Run a cursor iteration stress test over the children of `^iter`.
///
/// Writes `node_count` children, then walks them with one reusable cursor
/// until `operations` children have been visited. Each visit counts as one
/// operation; a pass that sees the wrong number of children counts as failed.
pub fn stress_cursor_iteration(conn: &Conn, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    for i in 0..config.node_count {
        let _ = conn.node("^iter", &[i.to_string()]).and_then(|node| node.set(""));
    }

    let start = Instant::now();
    let passes = config.operations.div_ceil(config.node_count.max(1));
    for _ in 0..passes {
        let result = conn.var("^iter").and_then(|root| {
            let mut children = root.children()?;
            let mut seen = 0;
            while children.advance()?.is_some() {
                seen += 1;
            }
            Ok(seen)
        });
        match result {
            Ok(seen) if seen == config.node_count => {
                successful.fetch_add(seen, Ordering::Relaxed);
            }
            _ => {
                failed.fetch_add(config.node_count, Ordering::Relaxed);
            }
        }
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{scenarios, TestClient};

    fn small_config() -> StressConfig {
        StressConfig {
            operations: 400,
            threads: 4,
            value_size: 64,
            node_count: 20,
        }
    }

    #[test]
    fn test_sequential_values() {
        let tc = TestClient::new();
        let result = stress_sequential_values(&tc.conn(), &small_config());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
    }

    #[test]
    fn test_concurrent_increments() {
        let tc = TestClient::new();
        let result = stress_concurrent_increments(Arc::clone(&tc.client), &small_config());
        assert_eq!(result.failed_ops, 0);
        let counter = tc.conn().var("^counter").unwrap().get_int().unwrap();
        assert_eq!(counter, result.successful_ops as i64);
    }

    #[test]
    fn test_concurrent_transfers_preserve_total() {
        let tc = TestClient::new();
        let config = small_config();
        let conn = tc.conn();
        scenarios::accounts(&conn, config.node_count, 100).unwrap();

        let result = stress_concurrent_transfers(Arc::clone(&tc.client), &config);
        assert_eq!(result.failed_ops, 0);

        let mut total = 0;
        let mut children = conn.var("^acct").unwrap().children().unwrap();
        while let Some(account) = children.advance().unwrap() {
            total += account.get_int().unwrap();
        }
        assert_eq!(total, 100 * config.node_count as i64);
    }

    #[test]
    fn test_cursor_iteration() {
        let tc = TestClient::new();
        let result = stress_cursor_iteration(&tc.conn(), &small_config());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
    }
}
