//! Transactions driven by Rust closures.
//!
//! The engine's `tp` entry point takes a plain function pointer and an
//! opaque parameter. The closure for a transaction is parked in a
//! process-wide registry under a generation-tagged token, and the engine is
//! handed a pointer to that token. The trampoline resolves the token, runs
//! the closure on a connection carrying the engine's transaction token and
//! maps the outcome back to a status.
//!
//! Errors and panics raised by the closure are captured in its frame and
//! rethrown once the engine has returned, so neither crosses the native
//! boundary.

use crate::buffer::NativeBuffer;
use crate::conn::Conn;
use crate::error::{codes, ClientError, ClientResult};
use parking_lot::{const_mutex, Mutex};
use std::any::Any;
use std::ffi::{c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use tracing::{debug, trace, warn};
use treeline_engine::status::{OK, TP_RESTART, TP_ROLLBACK};
use treeline_engine::{BufferDesc, MAX_ERRORMSG};

/// What a transaction closure asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Commit the transaction.
    Commit,
    /// Undo the transaction's updates and run the closure again.
    Restart,
    /// Undo the transaction's updates and return.
    Rollback,
}

type Callback<'a> = dyn FnMut(&Conn) -> ClientResult<TxnOutcome> + 'a;

struct Frame<'a> {
    parent: &'a Conn,
    callback: &'a mut Callback<'a>,
    error: Option<ClientError>,
    panic: Option<Box<dyn Any + Send>>,
}

#[derive(Clone, Copy)]
struct FramePtr(NonNull<c_void>);

// SAFETY: a frame pointer is only dereferenced by the thread that registered it,
// while that thread is blocked inside the engine's `tp`.
unsafe impl Send for FramePtr {}

struct Slot {
    generation: u32,
    frame: Option<FramePtr>,
}

struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

static REGISTRY: Mutex<Registry> = const_mutex(Registry {
    slots: Vec::new(),
    free: Vec::new(),
});

/// A registered frame; deregisters on drop.
struct Registration {
    token: u64,
}

impl Registration {
    fn new(frame: FramePtr) -> Self {
        let mut registry = REGISTRY.lock();
        let index = match registry.free.pop() {
            Some(index) => {
                registry.slots[index].frame = Some(frame);
                index
            }
            None => {
                registry.slots.push(Slot {
                    generation: 0,
                    frame: Some(frame),
                });
                registry.slots.len() - 1
            }
        };
        let token = (u64::from(registry.slots[index].generation) << 32) | (index as u64 + 1);
        trace!(token, "transaction callback registered");
        Self { token }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock();
        if let Some(index) = slot_index(self.token) {
            if let Some(slot) = registry.slots.get_mut(index) {
                slot.frame = None;
                slot.generation = slot.generation.wrapping_add(1);
                registry.free.push(index);
            }
        }
        trace!(token = self.token, "transaction callback deregistered");
    }
}

fn slot_index(token: u64) -> Option<usize> {
    ((token & u64::from(u32::MAX)) as usize).checked_sub(1)
}

fn lookup(token: u64) -> Option<FramePtr> {
    let registry = REGISTRY.lock();
    let slot = registry.slots.get(slot_index(token)?)?;
    if u64::from(slot.generation) != token >> 32 {
        return None;
    }
    slot.frame
}

unsafe extern "C" fn trampoline(tptoken: u64, errstr: *mut BufferDesc, param: *mut c_void) -> i32 {
    let Some(&token) = param.cast::<u64>().cast_const().as_ref() else {
        return codes::CALLBACK_NOT_FOUND;
    };
    let Some(frame) = lookup(token) else {
        warn!(token, "transaction callback not registered");
        return codes::CALLBACK_NOT_FOUND;
    };
    // SAFETY: the registering thread keeps the frame alive and untouched while it is registered.
    let frame = &mut *frame.0.as_ptr().cast::<Frame<'_>>();
    frame.error = None;

    let conn = Conn::for_transaction(frame.parent, tptoken, errstr);
    let callback = &mut *frame.callback;
    match panic::catch_unwind(AssertUnwindSafe(|| callback(&conn))) {
        Ok(Ok(TxnOutcome::Commit)) => OK,
        Ok(Ok(TxnOutcome::Restart)) => TP_RESTART,
        Ok(Ok(TxnOutcome::Rollback)) => TP_ROLLBACK,
        Ok(Err(err)) => {
            let code = err.code();
            if code != TP_RESTART && code != TP_ROLLBACK {
                frame.error = Some(err);
            }
            code
        }
        Err(payload) => {
            frame.panic = Some(payload);
            TP_ROLLBACK
        }
    }
}

/// Runs `f` in a transaction on `conn`, restoring the locals named by `names` on restart.
///
/// Returns `true` on commit and `false` on rollback. An error returned by `f`
/// is returned as is; a panic in `f` rolls the transaction back and resumes.
pub(crate) fn run<F>(conn: &Conn, transid: &str, names: &[BufferDesc], mut f: F) -> ClientResult<bool>
where
    F: FnMut(&Conn) -> ClientResult<TxnOutcome>,
{
    let transid_c = CString::new(transid)
        .map_err(|_| ClientError::invalid_argument(format!("transaction id {transid:?} contains NUL")))?;
    let mut errstr = NativeBuffer::sized(MAX_ERRORMSG);
    let mut frame = Frame {
        parent: conn,
        callback: &mut f,
        error: None,
        panic: None,
    };

    debug!(transid, tptoken = conn.tptoken(), "starting transaction");
    let status = {
        let registration = Registration::new(FramePtr(NonNull::from(&mut frame).cast()));
        let token = registration.token;
        conn.engine().tp(
            conn.tptoken(),
            errstr.desc_mut().ok(),
            trampoline,
            std::ptr::from_ref(&token).cast_mut().cast(),
            &transid_c,
            names,
        )
    };

    if let Some(payload) = frame.panic.take() {
        warn!(transid, "transaction callback panicked, rolled back");
        panic::resume_unwind(payload);
    }
    if let Some(err) = frame.error.take() {
        debug!(transid, code = err.code(), "transaction callback failed");
        return Err(err);
    }
    match status {
        OK => {
            debug!(transid, "transaction committed");
            Ok(true)
        }
        TP_ROLLBACK => {
            debug!(transid, "transaction rolled back");
            Ok(false)
        }
        other => Err(conn.error_from(other, &errstr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, ClientConfig};
    use std::sync::Arc;
    use treeline_engine::status::{GVUNDEF, TPRETRYLIMIT};
    use treeline_engine::{MemoryEngine, MemoryEngineConfig};

    fn setup(config: MemoryEngineConfig) -> (Arc<MemoryEngine>, Client) {
        let engine = Arc::new(MemoryEngine::with_config(config));
        let client = Client::init(engine.clone(), ClientConfig::default());
        (engine, client)
    }

    #[test]
    fn commit_makes_updates_visible() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        let committed = conn
            .transaction("test", &[], |txn| {
                assert!(txn.in_transaction());
                txn.node("^acct", &["1"])?.set("100")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        assert!(committed);
        assert!(!conn.in_transaction());
        assert_eq!(conn.node("^acct", &["1"]).unwrap().get().unwrap(), b"100");
    }

    #[test]
    fn rollback_discards_updates() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        conn.var("^x").unwrap().set("before").unwrap();
        let committed = conn
            .transaction("test", &[], |txn| {
                txn.var("^x")?.set("during")?;
                Ok(TxnOutcome::Rollback)
            })
            .unwrap();
        assert!(!committed);
        assert_eq!(conn.var("^x").unwrap().get().unwrap(), b"before");
    }

    #[test]
    fn restart_reruns_with_restored_locals() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        conn.var("count").unwrap().set("0").unwrap();
        let mut calls = 0;
        let committed = conn
            .transaction("test", &["count"], |txn| {
                calls += 1;
                let count = txn.var("count")?;
                assert_eq!(count.get()?, b"0");
                count.incr("1")?;
                Ok(if calls < 3 { TxnOutcome::Restart } else { TxnOutcome::Commit })
            })
            .unwrap();
        assert!(committed);
        assert_eq!(calls, 3);
        assert_eq!(conn.var("count").unwrap().get().unwrap(), b"1");
    }

    #[test]
    fn callback_error_is_returned_unchanged() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        let err = conn
            .transaction("test", &[], |txn| {
                txn.var("^written")?.set("1")?;
                let mut ret = NativeBuffer::with_capacity(4)?;
                crate::Key::from_parts("^absent", &[] as &[&str])?.get(txn, &mut ret)?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap_err();
        assert!(err.is(GVUNDEF));
        assert!(!conn.var("^written").unwrap().has_value().unwrap());
    }

    #[test]
    fn restart_limit_surfaces_engine_error() {
        let (_, client) = setup(MemoryEngineConfig::new().max_tp_restarts(2));
        let conn = client.conn();
        let err = conn
            .transaction("test", &[], |_| Ok(TxnOutcome::Restart))
            .unwrap_err();
        assert!(err.is(TPRETRYLIMIT));
    }

    #[test]
    fn failed_commit_reinvokes_callback() {
        let (engine, client) = setup(MemoryEngineConfig::default());
        engine.fail_next_commits(1);
        let conn = client.conn();
        let mut calls = 0;
        assert!(conn
            .transaction_fast(&["*"], |_| {
                calls += 1;
                Ok(TxnOutcome::Commit)
            })
            .unwrap());
        assert_eq!(calls, 2);
    }

    #[test]
    fn nested_transactions_commit_inner_first() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        conn.transaction("outer", &[], |outer| {
            outer.var("^n")?.set("outer")?;
            let inner = outer.transaction("inner", &[], |inner| {
                assert_ne!(inner.tptoken(), outer.tptoken());
                inner.node("^n", &["inner"])?.set("1")?;
                Ok(TxnOutcome::Commit)
            })?;
            assert!(inner);
            Ok(TxnOutcome::Commit)
        })
        .unwrap();
        assert_eq!(conn.node("^n", &["inner"]).unwrap().get().unwrap(), b"1");
    }

    #[test]
    fn panic_rolls_back_and_resumes() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = conn.transaction("test", &[], |txn| {
                txn.var("^p")?.set("1")?;
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        assert!(!conn.var("^p").unwrap().has_value().unwrap());
    }

    #[test]
    fn nul_in_transid_is_rejected() {
        let (_, client) = setup(MemoryEngineConfig::default());
        let conn = client.conn();
        let err = conn.transaction("a\0b", &[], |_| Ok(TxnOutcome::Commit)).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument { .. }));
    }

    #[test]
    fn stale_token_is_not_found() {
        let frame = FramePtr(NonNull::dangling());
        let token = Registration::new(frame).token;
        assert!(lookup(token).is_none());
        let again = Registration::new(frame);
        assert_ne!(again.token, token);
        assert!(lookup(again.token).is_some());
    }
}
