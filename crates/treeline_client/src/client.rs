//! Engine initialization and rundown.

use crate::config::ClientConfig;
use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, info, warn};
use treeline_engine::status::OK;
use treeline_engine::Engine;

/// Why the client is shutting down; selects how long rundown may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Orderly exit; waits up to [`ClientConfig::normal_exit_wait`].
    Normal,
    /// Exit forced by a signal; waits up to [`ClientConfig::signal_exit_wait`].
    Signal,
}

/// Owns the engine handle and hands out connections.
///
/// `Client` is `Send + Sync`; share it across threads and give each
/// thread its own [`Conn`].
pub struct Client {
    engine: Arc<dyn Engine>,
    config: ClientConfig,
    shut_down: Mutex<bool>,
}

impl Client {
    /// Wraps an engine.
    pub fn init(engine: Arc<dyn Engine>, config: ClientConfig) -> Self {
        info!(?config, "client initialized");
        Self {
            engine,
            config,
            shut_down: Mutex::new(false),
        }
    }

    /// Creates a connection for the calling thread.
    pub fn conn(&self) -> Conn {
        Conn::new(Arc::clone(&self.engine), self.config.clone())
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns true once [`Client::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.lock()
    }

    /// Runs the engine down. Only the first call does anything.
    ///
    /// Waits up to the wait configured for `reason`; if rundown has not
    /// finished by then, returns [`ClientError::ShutdownIncomplete`] and
    /// leaves it running in the background.
    pub fn shutdown(&self, reason: ShutdownReason) -> ClientResult<()> {
        let mut shut_down = self.shut_down.lock();
        if *shut_down {
            debug!("shutdown already done");
            return Ok(());
        }
        *shut_down = true;

        let wait = match reason {
            ShutdownReason::Normal => self.config.normal_exit_wait,
            ShutdownReason::Signal => self.config.signal_exit_wait,
        };
        info!(?reason, ?wait, "shutting down engine");

        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let spawned = thread::Builder::new()
            .name("treeline-exit".to_owned())
            .spawn(move || {
                let _ = tx.send(engine.exit());
            });
        let status = match spawned {
            Ok(_) => match rx.recv_timeout(wait) {
                Ok(status) => status,
                Err(_) => {
                    warn!(?wait, "engine rundown did not finish in time");
                    return Err(ClientError::ShutdownIncomplete { waited: wait });
                }
            },
            Err(err) => {
                warn!(%err, "could not spawn rundown thread, exiting inline");
                self.engine.exit()
            }
        };
        if status != OK {
            return Err(ClientError::engine(status, format!("engine exit failed with status {status}")));
        }
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
