//! Test fixtures and client helpers.
//!
//! Provides convenience functions for setting up a client over a fresh
//! in-memory engine and common test trees.

use std::sync::Arc;
use treeline_client::{Client, ClientConfig, Conn};
use treeline_engine::{MemoryEngine, MemoryEngineConfig};

/// A client over its own in-memory engine.
pub struct TestClient {
    /// The engine, for test hooks such as forced commit failures.
    pub engine: Arc<MemoryEngine>,
    /// The client instance.
    pub client: Arc<Client>,
}

impl TestClient {
    /// Creates a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryEngineConfig::default(), ClientConfig::default())
    }

    /// Creates a client with the given engine and client configuration.
    pub fn with_config(engine_config: MemoryEngineConfig, client_config: ClientConfig) -> Self {
        let engine = Arc::new(MemoryEngine::with_config(engine_config));
        let client = Arc::new(Client::init(engine.clone(), client_config));
        Self { engine, client }
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Runs a test with a connection to a fresh in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use treeline_testkit::with_conn;
///
/// #[test]
/// fn my_test() {
///     with_conn(|conn| {
///         conn.var("^x").unwrap().set("1").unwrap();
///     });
/// }
/// ```
pub fn with_conn<F, R>(f: F) -> R
where
    F: FnOnce(&Conn) -> R,
{
    let test_client = TestClient::new();
    let conn = test_client.conn();
    f(&conn)
}

/// Runs a test with a fresh client, for tests that need engine hooks.
pub fn with_test_client<F, R>(f: F) -> R
where
    F: FnOnce(&TestClient) -> R,
{
    let test_client = TestClient::new();
    f(&test_client)
}

/// Test scenario helpers.
pub mod scenarios {
    use treeline_client::{ClientResult, Conn};

    /// Subscripts stored under `^hello` by [`greetings`].
    pub const GREETING_SUBSCRIPTS: [&str; 3] = ["shire", "Winterfell", "world"];

    /// Stores one greeting per subscript in [`GREETING_SUBSCRIPTS`].
    pub fn greetings(conn: &Conn) -> ClientResult<()> {
        for place in GREETING_SUBSCRIPTS {
            conn.node("^hello", &[place])?.set(format!("Go {place}"))?;
        }
        Ok(())
    }

    /// Builds a tree under `varname` with `fanout` children per level, `depth` levels deep.
    ///
    /// Every node is given its path as value, so `^t(1,2)` holds `"1,2"`.
    /// Returns the number of nodes written.
    pub fn populated_tree(conn: &Conn, varname: &str, fanout: usize, depth: usize) -> ClientResult<usize> {
        let mut written = 0;
        let mut level: Vec<Vec<String>> = vec![Vec::new()];
        for _ in 0..depth {
            let mut next = Vec::with_capacity(level.len() * fanout);
            for path in &level {
                for i in 1..=fanout {
                    let mut child = path.clone();
                    child.push(i.to_string());
                    conn.node(varname, &child)?.set(child.join(","))?;
                    written += 1;
                    next.push(child);
                }
            }
            level = next;
        }
        Ok(written)
    }

    /// Stores `count` accounts under `^acct`, each holding `balance`.
    pub fn accounts(conn: &Conn, count: usize, balance: i64) -> ClientResult<()> {
        for i in 0..count {
            conn.node("^acct", &[i.to_string()])?.set(balance.to_string())?;
        }
        Ok(())
    }
}
