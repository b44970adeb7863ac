//! Low-level addressing: a variable name plus subscripts.

use crate::buffer::{read_desc, NativeBuffer};
use crate::buffer_set::BufferSet;
use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryableCall;
use std::time::Duration;
use treeline_engine::status::{INVSTRLEN, NODEEND, OK};
use treeline_engine::{BufferDesc, DeleteKind, MAX_SUBSCRIPTS};

/// The address of a node: a variable name buffer and a subscript set.
///
/// Every operation takes the connection to call through and, where the
/// engine returns data, a caller-owned output buffer. Outputs that are too
/// small are grown to the size the engine reports and the call is retried,
/// except for [`Key::incr`], which has already taken effect.
///
/// Only the used elements of `subs` are part of the address.
///
/// ```rust
/// use std::sync::Arc;
/// use treeline_client::{Client, ClientConfig, Key, NativeBuffer};
/// use treeline_engine::MemoryEngine;
///
/// let client = Client::init(Arc::new(MemoryEngine::new()), ClientConfig::default());
/// let conn = client.conn();
///
/// let key = Key::from_parts("^hello", &["world"])?;
/// key.set(&conn, &NativeBuffer::from_value(b"Go world")?)?;
///
/// let mut value = NativeBuffer::with_capacity(2)?;
/// key.get(&conn, &mut value)?;
/// assert_eq!(value.value()?, b"Go world");
/// # Ok::<(), treeline_client::ClientError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Key {
    /// Variable name; a leading `^` makes it a global.
    pub varname: NativeBuffer,
    /// Subscripts, in order.
    pub subs: BufferSet,
}

impl Key {
    /// Creates a key with nothing allocated.
    pub const fn new() -> Self {
        Self {
            varname: NativeBuffer::new(),
            subs: BufferSet::new(),
        }
    }

    /// Allocates the name buffer and `subs_count` subscripts of `sub_size` bytes.
    pub fn allocate(&mut self, varname_size: u32, subs_count: u32, sub_size: u32) -> ClientResult<()> {
        self.varname.allocate(varname_size)?;
        self.subs.allocate(subs_count, sub_size)
    }

    /// Builds a key holding `varname` and `subs`.
    pub fn from_parts<S: AsRef<[u8]>>(varname: &str, subs: &[S]) -> ClientResult<Self> {
        Ok(Self {
            varname: NativeBuffer::from_value(varname.as_bytes())?,
            subs: BufferSet::from_values(subs)?,
        })
    }

    /// Frees both buffers.
    pub fn release(&mut self) {
        self.varname.release();
        self.subs.release();
    }

    /// Validates the key and returns its descriptors.
    fn parts(&self) -> ClientResult<(&BufferDesc, &[BufferDesc])> {
        let varname = self.varname.desc()?;
        if varname.is_stale() {
            read_desc(varname)?;
        }
        if varname.len_used == 0 {
            return Err(ClientError::invalid_varname(""));
        }
        let subs = self.subs.descs()?;
        if subs.len() > MAX_SUBSCRIPTS {
            return Err(ClientError::TooManySubscripts {
                count: subs.len(),
                max: MAX_SUBSCRIPTS,
            });
        }
        if let Some(stale) = subs.iter().find(|d| d.is_stale()) {
            read_desc(stale)?;
        }
        Ok((varname, subs))
    }

    /// Returns 0 (undefined), 1 (value), 10 (subtree) or 11 (both).
    pub fn data(&self, conn: &Conn) -> ClientResult<u32> {
        let (varname, subs) = self.parts()?;
        let mut ret = 0;
        let status = conn.invoke(|engine, tptoken, errstr| engine.data(tptoken, errstr, varname, subs, &mut ret));
        conn.check(status)?;
        Ok(ret)
    }

    /// Deletes the node's value, or the node and its subtree.
    pub fn delete(&self, conn: &Conn, kind: DeleteKind) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let status = conn.invoke(|engine, tptoken, errstr| engine.delete(tptoken, errstr, varname, subs, kind));
        conn.check(status)
    }

    /// Fetches the node's value into `ret`.
    pub fn get(&self, conn: &Conn, ret: &mut NativeBuffer) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let status = RetryableCall::new(conn, "get")
            .run_value(ret, |engine, tptoken, errstr, out| engine.get(tptoken, errstr, varname, subs, out))?;
        conn.check(status)
    }

    /// Stores the value held in `value`.
    pub fn set(&self, conn: &Conn, value: &NativeBuffer) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let value = value.desc()?;
        if value.is_stale() {
            read_desc(value)?;
        }
        let status = conn.invoke(|engine, tptoken, errstr| engine.set(tptoken, errstr, varname, subs, value));
        conn.check(status)
    }

    /// Adds `increment` (1 when `None`) and writes the new value into `ret`.
    ///
    /// The increment happens even when `ret` is too small; that case fails
    /// with [`ClientError::CapacityExceeded`] and is never retried.
    pub fn incr(&self, conn: &Conn, increment: Option<&NativeBuffer>, ret: &mut NativeBuffer) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let increment = increment.map(NativeBuffer::desc).transpose()?;
        let out = ret.desc_mut()?;
        let status = conn.invoke(|engine, tptoken, errstr| {
            engine.incr(tptoken, errstr, varname, subs, increment, &mut *out)
        });
        if status == INVSTRLEN && out.is_stale() {
            return Err(ClientError::CapacityExceeded {
                required: out.len_used,
                capacity: out.len_alloc,
            });
        }
        conn.check(status)
    }

    /// Acquires the lock on this node or increments its count, waiting up to `timeout`.
    ///
    /// A timeout fails with the engine's `LOCK_TIMEOUT` code.
    pub fn lock_incr(&self, conn: &Conn, timeout: Duration) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let status =
            conn.invoke(|engine, tptoken, errstr| engine.lock_incr(tptoken, errstr, timeout_ns, varname, subs));
        conn.check(status)
    }

    /// Decrements this node's lock count, releasing the lock at zero.
    pub fn lock_decr(&self, conn: &Conn) -> ClientResult<()> {
        let (varname, subs) = self.parts()?;
        let status = conn.invoke(|engine, tptoken, errstr| engine.lock_decr(tptoken, errstr, varname, subs));
        conn.check(status)
    }

    /// Writes the next subscript at this depth into `ret`. Returns `false` when there is none.
    pub fn subscript_next(&self, conn: &Conn, ret: &mut NativeBuffer) -> ClientResult<bool> {
        self.step_subscript(conn, ret, false)
    }

    /// Writes the previous subscript at this depth into `ret`. Returns `false` when there is none.
    pub fn subscript_prev(&self, conn: &Conn, ret: &mut NativeBuffer) -> ClientResult<bool> {
        self.step_subscript(conn, ret, true)
    }

    fn step_subscript(&self, conn: &Conn, ret: &mut NativeBuffer, reverse: bool) -> ClientResult<bool> {
        let (varname, subs) = self.parts()?;
        let entry = if reverse { "subscript_previous" } else { "subscript_next" };
        let status = RetryableCall::new(conn, entry).run_value(ret, |engine, tptoken, errstr, out| {
            if reverse {
                engine.subscript_previous(tptoken, errstr, varname, subs, out)
            } else {
                engine.subscript_next(tptoken, errstr, varname, subs, out)
            }
        })?;
        match status {
            OK => Ok(true),
            NODEEND => Ok(false),
            other => Err(conn.error(other)),
        }
    }

    /// Writes the subscripts of the next node with a value, depth first, into `ret`.
    ///
    /// Returns `false` at the end of the tree.
    pub fn node_next(&self, conn: &Conn, ret: &mut BufferSet) -> ClientResult<bool> {
        self.step_node(conn, ret, false)
    }

    /// Writes the subscripts of the previous node with a value into `ret`.
    pub fn node_prev(&self, conn: &Conn, ret: &mut BufferSet) -> ClientResult<bool> {
        self.step_node(conn, ret, true)
    }

    fn step_node(&self, conn: &Conn, ret: &mut BufferSet, reverse: bool) -> ClientResult<bool> {
        let (varname, subs) = self.parts()?;
        let entry = if reverse { "node_previous" } else { "node_next" };
        let status = RetryableCall::new(conn, entry).run_subs(ret, |engine, tptoken, errstr, used, out| {
            if reverse {
                engine.node_previous(tptoken, errstr, varname, subs, used, out)
            } else {
                engine.node_next(tptoken, errstr, varname, subs, used, out)
            }
        })?;
        match status {
            OK => Ok(true),
            NODEEND => Ok(false),
            other => Err(conn.error(other)),
        }
    }
}
