//! High-level paths and cursors.
//!
//! A [`Node`] holds its variable name and subscripts in one native block, so
//! it can be passed to the engine as is. Nodes are immutable snapshots except
//! for cursors: a mutable node keeps spare capacity on its last slot and is
//! rewritten in place as it steps through siblings, reallocating only when a
//! subscript outgrows that capacity.

use crate::block::DescBlock;
use crate::buffer::{check_size, read_desc, view_desc, write_desc, NativeBuffer};
use crate::conn::Conn;
use crate::cursor::{Children, Tree};
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryableCall;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use treeline_engine::status::{GVUNDEF, INSUFFSUBS, INVSTRLEN, LOCK_TIMEOUT, LVUNDEF, NODEEND, OK};
use treeline_engine::{BufferDesc, DeleteKind, MAX_STR, MAX_SUBSCRIPTS, MAX_TIME_NS};

/// A path in the engine's tree: a variable name and ordered subscripts.
///
/// Two nodes are equal when their paths are equal, whatever storage backs them.
///
/// ```rust
/// use std::sync::Arc;
/// use treeline_client::{Client, ClientConfig};
/// use treeline_engine::MemoryEngine;
///
/// let client = Client::init(Arc::new(MemoryEngine::new()), ClientConfig::default());
/// let conn = client.conn();
///
/// let people = conn.var("^people")?;
/// for name in ["ann", "bob"] {
///     people.child(&[name])?.set("1")?;
/// }
///
/// let mut children = people.children()?;
/// let mut names = Vec::new();
/// while let Some(child) = children.advance()? {
///     names.push(child.subscript(-1)?);
/// }
/// assert_eq!(names, [b"ann".to_vec(), b"bob".to_vec()]);
/// # Ok::<(), treeline_client::ClientError>(())
/// ```
pub struct Node<'c> {
    conn: &'c Conn,
    block: DescBlock,
    len: usize,
    mutable: bool,
}

impl<'c> Node<'c> {
    /// Builds a node from `parts` (varname first), adding `slack` bytes to the last slot.
    pub(crate) fn build(conn: &'c Conn, parts: &[&[u8]], slack: u32, mutable: bool) -> ClientResult<Self> {
        let Some((varname, subs)) = parts.split_first() else {
            return Err(ClientError::invalid_varname(""));
        };
        if varname.is_empty() {
            return Err(ClientError::invalid_varname(""));
        }
        if subs.len() > MAX_SUBSCRIPTS {
            return Err(ClientError::TooManySubscripts {
                count: subs.len(),
                max: MAX_SUBSCRIPTS,
            });
        }
        let mut sizes = parts
            .iter()
            .map(|part| {
                let size = u32::try_from(part.len()).unwrap_or(u32::MAX);
                check_size(size)?;
                Ok(size)
            })
            .collect::<ClientResult<Vec<u32>>>()?;
        if let Some(last) = sizes.last_mut() {
            *last = last.saturating_add(slack).min(MAX_STR);
        }

        let mut block = DescBlock::new(&sizes)?;
        for (desc, part) in block.descs_mut().iter_mut().zip(parts) {
            write_desc(desc, part)?;
        }
        Ok(Self {
            conn,
            block,
            len: parts.len(),
            mutable,
        })
    }

    fn slot(&self, index: usize) -> &[u8] {
        view_desc(&self.block.descs()[index])
    }

    /// Returns the varname descriptor and the subscript descriptors.
    pub(crate) fn key_descs(&self) -> (&BufferDesc, &[BufferDesc]) {
        let descs = &self.block.descs()[..self.len];
        (&descs[0], &descs[1..])
    }

    /// Returns the varname followed by every subscript.
    pub fn parts(&self) -> ClientResult<Vec<Vec<u8>>> {
        self.block.descs()[..self.len].iter().map(read_desc).collect()
    }

    /// Rebuilds this path with its last part replaced.
    fn with_last(&self, last: &[u8], slack: u32, mutable: bool) -> ClientResult<Node<'c>> {
        let mut parts: Vec<&[u8]> = (0..self.len - 1).map(|i| self.slot(i)).collect();
        parts.push(last);
        Self::build(self.conn, &parts, slack, mutable)
    }

    /// Returns true if `self` lies strictly below `ancestor`.
    pub(crate) fn is_below(&self, ancestor: &Node<'_>) -> bool {
        self.len > ancestor.len && (0..ancestor.len).all(|i| self.slot(i) == ancestor.slot(i))
    }

    /// Returns the connection this node calls through.
    pub fn conn(&self) -> &'c Conn {
        self.conn
    }

    /// Returns a node for a descendant, `subs` below this one.
    pub fn child<S: AsRef<[u8]>>(&self, subs: &[S]) -> ClientResult<Node<'c>> {
        let mut parts: Vec<&[u8]> = (0..self.len).map(|i| self.slot(i)).collect();
        parts.extend(subs.iter().map(AsRef::as_ref));
        Self::build(self.conn, &parts, 0, false)
    }

    /// Returns the variable name.
    pub fn varname(&self) -> String {
        String::from_utf8_lossy(self.slot(0)).into_owned()
    }

    /// Returns the number of subscripts.
    pub fn depth(&self) -> usize {
        self.len - 1
    }

    /// Returns subscript `index`; a negative index counts from the last subscript.
    pub fn subscript(&self, index: isize) -> ClientResult<Vec<u8>> {
        let depth = self.depth();
        let resolved = if index < 0 {
            depth.checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs()).filter(|&i| i < depth)
        };
        match resolved {
            Some(i) => Ok(self.slot(i + 1).to_vec()),
            None => Err(ClientError::IndexOutOfRange {
                index: index.unsigned_abs(),
                len: depth,
            }),
        }
    }

    /// Returns every subscript.
    pub fn subscripts(&self) -> Vec<Vec<u8>> {
        (1..self.len).map(|i| self.slot(i).to_vec()).collect()
    }

    /// Renders the node and its subtree, one `path=value` line per node with a value.
    ///
    /// Stops after `max_lines` lines with a `...` line; values longer than
    /// `max_value` bytes are cut and marked with a trailing `...`.
    pub fn dump(&self, max_lines: Option<usize>, max_value: Option<usize>) -> ClientResult<String> {
        let own = if self.has_value()? { Some(Ok(self.clone())) } else { None };
        let mut out = String::new();
        let mut lines = 0;
        for node in own.into_iter().chain(self.tree()) {
            let node = node?;
            if max_lines.is_some_and(|max| lines >= max) {
                out.push_str("...\n");
                break;
            }
            let mut value = node.get()?;
            let cut = max_value.is_some_and(|max| value.len() > max);
            if let Some(max) = max_value {
                value.truncate(max);
            }
            let quoted = self.conn.quote(&value)?;
            out.push_str(&format!("{node}={quoted}{}\n", if cut { "..." } else { "" }));
            lines += 1;
        }
        Ok(out)
    }

    /// Stores `value` at this node.
    pub fn set(&self, value: impl AsRef<[u8]>) -> ClientResult<()> {
        let value = self.conn.value_buffer(value.as_ref())?;
        let value = value.desc()?;
        let (varname, subs) = self.key_descs();
        let status = self
            .conn
            .invoke(|engine, tptoken, errstr| engine.set(tptoken, errstr, varname, subs, value));
        self.conn.check(status)
    }

    /// Returns the value, or `None` if the node has none.
    pub fn lookup(&self) -> ClientResult<Option<Vec<u8>>> {
        let conn = self.conn;
        let mut scratch = conn.scratch();
        let (varname, subs) = self.key_descs();
        let status = RetryableCall::new(conn, "get")
            .run_value(&mut scratch, |engine, tptoken, errstr, out| engine.get(tptoken, errstr, varname, subs, out))?;
        match status {
            OK => Ok(Some(scratch.value()?)),
            GVUNDEF | LVUNDEF => Ok(None),
            other => Err(conn.error(other)),
        }
    }

    /// Returns the value; empty if the node has none.
    pub fn get(&self) -> ClientResult<Vec<u8>> {
        Ok(self.lookup()?.unwrap_or_default())
    }

    /// Returns the value, or `default` if the node has none.
    pub fn get_or(&self, default: impl AsRef<[u8]>) -> ClientResult<Vec<u8>> {
        Ok(self.lookup()?.unwrap_or_else(|| default.as_ref().to_vec()))
    }

    /// Returns the value parsed as an integer; 0 if absent or not an integer.
    pub fn get_int(&self) -> ClientResult<i64> {
        let value = self.get()?;
        Ok(std::str::from_utf8(&value).ok().and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    /// Returns the value parsed as a float; 0.0 if absent or not a number.
    pub fn get_float(&self) -> ClientResult<f64> {
        let value = self.get()?;
        Ok(std::str::from_utf8(&value).ok().and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    /// Returns 0 (nothing), 1 (value), 10 (subtree) or 11 (both).
    pub fn data(&self) -> ClientResult<u32> {
        let (varname, subs) = self.key_descs();
        let mut ret = 0;
        let status = self
            .conn
            .invoke(|engine, tptoken, errstr| engine.data(tptoken, errstr, varname, subs, &mut ret));
        self.conn.check(status)?;
        Ok(ret)
    }

    /// Returns true if the node has a value.
    pub fn has_value(&self) -> ClientResult<bool> {
        Ok(self.data()? % 2 == 1)
    }

    /// Returns true if the node has a value and no subtree.
    pub fn has_value_only(&self) -> ClientResult<bool> {
        Ok(self.data()? == 1)
    }

    /// Returns true if the node has a subtree.
    pub fn has_tree(&self) -> ClientResult<bool> {
        Ok(self.data()? >= 10)
    }

    /// Returns true if the node has a subtree and no value.
    pub fn has_tree_only(&self) -> ClientResult<bool> {
        Ok(self.data()? == 10)
    }

    /// Returns true if the node has both a value and a subtree.
    pub fn has_both(&self) -> ClientResult<bool> {
        Ok(self.data()? == 11)
    }

    /// Returns true if the node has neither a value nor a subtree.
    pub fn has_none(&self) -> ClientResult<bool> {
        Ok(self.data()? == 0)
    }

    fn delete(&self, kind: DeleteKind) -> ClientResult<()> {
        let (varname, subs) = self.key_descs();
        let status = self
            .conn
            .invoke(|engine, tptoken, errstr| engine.delete(tptoken, errstr, varname, subs, kind));
        self.conn.check(status)
    }

    /// Deletes the node and its subtree.
    pub fn kill(&self) -> ClientResult<()> {
        self.delete(DeleteKind::Tree)
    }

    /// Deletes the node's value, keeping its subtree.
    pub fn clear(&self) -> ClientResult<()> {
        self.delete(DeleteKind::Node)
    }

    /// Atomically adds `amount` to the node and returns the new value.
    pub fn incr(&self, amount: impl AsRef<[u8]>) -> ClientResult<Vec<u8>> {
        let amount = amount.as_ref();
        if amount.is_empty() {
            return Err(ClientError::invalid_argument("increment amount is empty"));
        }
        let increment = NativeBuffer::from_value(amount)?;
        let by = increment.desc()?;
        let (varname, subs) = self.key_descs();
        let conn = self.conn;
        let mut scratch = conn.scratch();
        let out = scratch.desc_mut()?;
        let status = conn.invoke(|engine, tptoken, errstr| {
            engine.incr(tptoken, errstr, varname, subs, Some(by), &mut *out)
        });
        if status == INVSTRLEN && out.is_stale() {
            // The increment has been applied; read the result back.
            drop(scratch);
            return self.get();
        }
        conn.check(status)?;
        scratch.value()
    }

    /// Acquires or increments the lock on this node.
    ///
    /// `None` waits until the lock is acquired. Returns `false` if `timeout` expired.
    pub fn lock(&self, timeout: Option<Duration>) -> ClientResult<bool> {
        let timeout_ns = match timeout {
            Some(t) => u64::try_from(t.as_nanos()).unwrap_or(u64::MAX),
            None => MAX_TIME_NS,
        };
        let (varname, subs) = self.key_descs();
        loop {
            let status = self
                .conn
                .invoke(|engine, tptoken, errstr| engine.lock_incr(tptoken, errstr, timeout_ns, varname, subs));
            match status {
                OK => return Ok(true),
                LOCK_TIMEOUT if timeout.is_some() => return Ok(false),
                LOCK_TIMEOUT => debug!(node = %self, "lock wait expired, waiting again"),
                other => return Err(self.conn.error(other)),
            }
        }
    }

    /// Decrements the lock count on this node.
    pub fn unlock(&self) -> ClientResult<()> {
        let (varname, subs) = self.key_descs();
        let status = self
            .conn
            .invoke(|engine, tptoken, errstr| engine.lock_decr(tptoken, errstr, varname, subs));
        self.conn.check(status)
    }

    /// Returns true if this node is a cursor that [`Node::mutate`] rewrites in place.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Replaces the last subscript (the varname of an unsubscripted node).
    ///
    /// A mutable node is rewritten in place while the value fits; otherwise it
    /// is rebuilt with spare capacity and becomes mutable.
    pub fn mutate(&mut self, sub: impl AsRef<[u8]>) -> ClientResult<()> {
        let sub = sub.as_ref();
        let last = self.len - 1;
        if self.mutable && (last > 0 || !sub.is_empty()) {
            let desc = &mut self.block.descs_mut()[last];
            if sub.len() <= desc.len_alloc as usize {
                return write_desc(desc, sub);
            }
        }
        debug!(depth = self.depth(), size = sub.len(), "reallocating cursor");
        *self = self.with_last(sub, self.conn.config().subscript_prealloc, true)?;
        Ok(())
    }

    fn step_sibling(&self, ret: &mut NativeBuffer, reverse: bool) -> ClientResult<bool> {
        let (varname, subs) = self.key_descs();
        let entry = if reverse { "subscript_previous" } else { "subscript_next" };
        let status = RetryableCall::new(self.conn, entry).run_value(ret, |engine, tptoken, errstr, out| {
            if reverse {
                engine.subscript_previous(tptoken, errstr, varname, subs, out)
            } else {
                engine.subscript_next(tptoken, errstr, varname, subs, out)
            }
        })?;
        match status {
            OK => Ok(true),
            NODEEND => Ok(false),
            other => Err(self.conn.error(other)),
        }
    }

    fn sibling(&self, reverse: bool) -> ClientResult<Option<Node<'c>>> {
        let conn = self.conn;
        let mut scratch = conn.scratch();
        if !self.step_sibling(&mut scratch, reverse)? {
            return Ok(None);
        }
        self.with_last(view_desc(scratch.desc()?), 0, false).map(Some)
    }

    /// Returns the next node at this depth in collation order.
    pub fn next_sibling(&self) -> ClientResult<Option<Node<'c>>> {
        self.sibling(false)
    }

    /// Returns the previous node at this depth in collation order.
    pub fn prev_sibling(&self) -> ClientResult<Option<Node<'c>>> {
        self.sibling(true)
    }

    /// Moves this node to its next (or previous) sibling in place.
    ///
    /// Returns `false`, leaving the node unchanged, when there is none.
    pub fn advance(&mut self, reverse: bool) -> ClientResult<bool> {
        let conn = self.conn;
        let mut scratch = conn.scratch();
        if !self.step_sibling(&mut scratch, reverse)? {
            return Ok(false);
        }
        self.mutate(view_desc(scratch.desc()?))?;
        Ok(true)
    }

    /// Iterates the children of this node in collation order.
    pub fn children(&self) -> ClientResult<Children<'c>> {
        Ok(Children::new(self.child_cursor()?, false))
    }

    /// Iterates the children of this node in reverse collation order.
    pub fn children_rev(&self) -> ClientResult<Children<'c>> {
        Ok(Children::new(self.child_cursor()?, true))
    }

    fn child_cursor(&self) -> ClientResult<Node<'c>> {
        let mut parts: Vec<&[u8]> = (0..self.len).map(|i| self.slot(i)).collect();
        parts.push(b"");
        Self::build(self.conn, &parts, self.conn.config().subscript_prealloc, true)
    }

    /// Returns the next node with a value in depth-first order, anywhere under this variable.
    pub fn tree_next(&self) -> ClientResult<Option<Node<'c>>> {
        self.step_tree(false)
    }

    /// Returns the previous node with a value in depth-first order.
    pub fn tree_prev(&self) -> ClientResult<Option<Node<'c>>> {
        self.step_tree(true)
    }

    /// Iterates the descendants of this node that have values, depth first.
    pub fn tree(&self) -> Tree<'c> {
        Tree::new(self.clone())
    }

    fn step_tree(&self, reverse: bool) -> ClientResult<Option<Node<'c>>> {
        let entry = if reverse { "node_previous" } else { "node_next" };
        let (varname, subs) = self.key_descs();
        let prealloc = self.conn.config().subscript_prealloc;
        let mut retry = RetryableCall::new(self.conn, entry);
        let mut count = (self.depth() + 1).min(MAX_SUBSCRIPTS) as u32;

        'block: loop {
            let mut sizes = vec![prealloc; count as usize + 1];
            sizes[0] = varname.len_used;
            let mut block = DescBlock::new(&sizes)?;
            write_desc(&mut block.descs_mut()[0], self.slot(0))?;
            let mut overflow: Vec<NativeBuffer> = Vec::new();

            loop {
                let mut used = count;
                let status = self.conn.invoke(|engine, tptoken, errstr| {
                    let out = &mut block.descs_mut()[1..];
                    if reverse {
                        engine.node_previous(tptoken, errstr, varname, subs, &mut used, out)
                    } else {
                        engine.node_next(tptoken, errstr, varname, subs, &mut used, out)
                    }
                });
                match status {
                    OK if overflow.is_empty() => {
                        return Ok(Some(Node {
                            conn: self.conn,
                            block,
                            len: used as usize + 1,
                            mutable: false,
                        }));
                    }
                    OK => {
                        let parts = block.descs()[..=used as usize]
                            .iter()
                            .map(read_desc)
                            .collect::<ClientResult<Vec<_>>>()?;
                        let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                        return Self::build(self.conn, &parts, 0, false).map(Some);
                    }
                    NODEEND => return Ok(None),
                    INSUFFSUBS => {
                        retry.grow("subscript count", used, count, MAX_SUBSCRIPTS as u32)?;
                        count = used;
                        continue 'block;
                    }
                    INVSTRLEN => {
                        let index = used as usize + 1;
                        let Some(&slot) = block.descs().get(index).filter(|d| d.is_stale()) else {
                            return Err(self.conn.error(status));
                        };
                        retry.grow("subscript size", slot.len_used, slot.len_alloc, MAX_STR)?;
                        let mut spill = NativeBuffer::with_capacity(slot.len_used)?;
                        let spill_desc = *spill.desc_mut()?;
                        block.descs_mut()[index] = BufferDesc {
                            len_used: 0,
                            ..spill_desc
                        };
                        overflow.push(spill);
                    }
                    other => return Err(self.conn.error(other)),
                }
            }
        }
    }
}

impl Clone for Node<'_> {
    /// Copies the path into a new block. The copy is never a cursor.
    fn clone(&self) -> Self {
        Self {
            conn: self.conn,
            block: self.block.clone(),
            len: self.len,
            mutable: false,
        }
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && (0..self.len).all(|i| self.slot(i) == other.slot(i))
    }
}

impl Eq for Node<'_> {}

impl fmt::Display for Node<'_> {
    /// Formats as `name(sub1,sub2)` with subscripts quoted like ZWRITE output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.varname())?;
        if self.len == 1 {
            return Ok(());
        }
        f.write_str("(")?;
        for i in 1..self.len {
            if i > 1 {
                f.write_str(",")?;
            }
            match self.conn.quote(self.slot(i)) {
                Ok(quoted) => f.write_str(&quoted)?,
                Err(_) => write!(f, "{:?}", String::from_utf8_lossy(self.slot(i)))?,
            }
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.to_string())
            .field("mutable", &self.mutable)
            .finish()
    }
}
