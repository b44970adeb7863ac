//! Per-thread connection to the engine.

use crate::buffer::{check_size, NativeBuffer};
use crate::buffer_set::BufferSet;
use crate::config::ClientConfig;
use crate::error::{special_message, ClientError, ClientResult};
use crate::node::Node;
use crate::retry::RetryableCall;
use crate::transaction::TxnOutcome;
use crate::variadic::VariadicCall;
use std::cell::{RefCell, RefMut};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use treeline_engine::status::{self, INVSTRLEN, LOCK_TIMEOUT, OK};
use treeline_engine::{BufferDesc, Engine, VariadicEntry, MAX_ERRORMSG, MAX_PARAMS, NOTTP};

/// A connection: the context every engine call is made through.
///
/// Holds the transaction token, the error-string buffer the engine reports
/// into, a reusable value buffer and the variadic parameter block. A
/// connection may move between threads but cannot be shared by them; create
/// one per thread with [`crate::Client::conn`].
pub struct Conn {
    engine: Arc<dyn Engine>,
    config: ClientConfig,
    tptoken: u64,
    errstr: RefCell<NativeBuffer>,
    scratch: RefCell<NativeBuffer>,
    params: RefCell<treeline_engine::ParamBlock>,
}

impl Conn {
    pub(crate) fn new(engine: Arc<dyn Engine>, config: ClientConfig) -> Self {
        Self::with_token(engine, config, NOTTP, NativeBuffer::sized(MAX_ERRORMSG))
    }

    fn with_token(engine: Arc<dyn Engine>, config: ClientConfig, tptoken: u64, errstr: NativeBuffer) -> Self {
        Self {
            engine,
            config,
            tptoken,
            errstr: RefCell::new(errstr),
            scratch: RefCell::new(NativeBuffer::new()),
            params: RefCell::new(treeline_engine::ParamBlock::new()),
        }
    }

    /// Creates the connection a transaction callback runs on.
    ///
    /// # Safety
    ///
    /// `errstr`, if non-null, must stay valid for the connection's lifetime.
    pub(crate) unsafe fn for_transaction(parent: &Conn, tptoken: u64, errstr: *mut BufferDesc) -> Self {
        let errstr = match NonNull::new(errstr) {
            Some(desc) => NativeBuffer::borrowed(desc),
            None => NativeBuffer::sized(MAX_ERRORMSG),
        };
        Self::with_token(Arc::clone(&parent.engine), parent.config.clone(), tptoken, errstr)
    }

    /// Returns the transaction token calls are made with.
    pub fn tptoken(&self) -> u64 {
        self.tptoken
    }

    /// Returns true inside a transaction callback.
    pub fn in_transaction(&self) -> bool {
        self.tptoken != NOTTP
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn params(&self) -> RefMut<'_, treeline_engine::ParamBlock> {
        self.params.borrow_mut()
    }

    /// Calls the engine with this connection's token and a cleared error string.
    pub(crate) fn invoke<F>(&self, f: F) -> i32
    where
        F: FnOnce(&dyn Engine, u64, Option<&mut BufferDesc>) -> i32,
    {
        let mut errstr = self.errstr.borrow_mut();
        let mut desc = errstr.desc_mut().ok();
        if let Some(desc) = desc.as_deref_mut() {
            desc.len_used = 0;
        }
        f(&*self.engine, self.tptoken, desc)
    }

    /// Maps a status to `Ok` or to the error the last call reported.
    pub(crate) fn check(&self, status: i32) -> ClientResult<()> {
        if status == OK {
            Ok(())
        } else {
            Err(self.error(status))
        }
    }

    pub(crate) fn error(&self, status: i32) -> ClientError {
        self.error_from(status, &self.errstr.borrow())
    }

    /// Builds the error for `status`, preferring the text in `errstr`.
    pub(crate) fn error_from(&self, status: i32, errstr: &NativeBuffer) -> ClientError {
        if let Some(text) = special_message(status) {
            return ClientError::engine(status, text);
        }
        let message = errstr
            .value()
            .ok()
            .and_then(|raw| parse_errstr(&raw, status))
            .or_else(|| self.recover_message(status))
            .unwrap_or_else(|| format!("status {status}"));
        ClientError::engine(status, message)
    }

    fn recover_message(&self, status: i32) -> Option<String> {
        let mut out = NativeBuffer::sized(MAX_ERRORMSG);
        let desc = out.desc_mut().ok()?;
        if self.engine.message(self.tptoken, None, status, desc) == OK {
            return out.value_lossy().ok();
        }
        // The engine cannot look messages up once it has run down.
        status::message(status)
    }

    /// Returns the value scratch buffer, allocating it on first use.
    pub(crate) fn scratch(&self) -> RefMut<'_, NativeBuffer> {
        let mut scratch = self.scratch.borrow_mut();
        if !scratch.is_allocated() {
            *scratch = NativeBuffer::sized(self.config.value_overalloc);
        }
        scratch
    }

    /// Loads `bytes` into the scratch buffer, growing it with over-allocation.
    pub(crate) fn value_buffer(&self, bytes: &[u8]) -> ClientResult<RefMut<'_, NativeBuffer>> {
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        check_size(len)?;
        let mut scratch = self.scratch();
        if scratch.len_alloc()? < len {
            *scratch = NativeBuffer::sized(len.saturating_add(self.config.value_overalloc));
        }
        scratch.set_value(bytes)?;
        Ok(scratch)
    }

    /// Creates a node for `varname` with `subs`.
    ///
    /// A name starting with `^` is a global; otherwise it is a local.
    pub fn node<S: AsRef<[u8]>>(&self, varname: &str, subs: &[S]) -> ClientResult<Node<'_>> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(subs.len() + 1);
        parts.push(varname.as_bytes());
        parts.extend(subs.iter().map(AsRef::as_ref));
        Node::build(self, &parts, 0, false)
    }

    /// Creates an unsubscripted node for `varname`.
    pub fn var(&self, varname: &str) -> ClientResult<Node<'_>> {
        Node::build(self, &[varname.as_bytes()], 0, false)
    }

    /// Copies `node`, which may belong to another connection, onto this one.
    pub fn clone_node(&self, node: &Node<'_>) -> ClientResult<Node<'_>> {
        let parts = node.parts()?;
        let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        Node::build(self, &parts, 0, false)
    }

    /// Encodes `bytes` in ZWRITE format.
    pub fn str2zwr(&self, bytes: &[u8]) -> ClientResult<String> {
        let input = NativeBuffer::from_value(bytes)?;
        let mut out = NativeBuffer::sized(u32::try_from(bytes.len() + 2).unwrap_or(u32::MAX));
        input.str2zwr(self, &mut out)?;
        out.value_lossy()
    }

    /// Decodes a ZWRITE-format string.
    pub fn zwr2str(&self, zwr: &str) -> ClientResult<Vec<u8>> {
        let input = NativeBuffer::from_value(zwr.as_bytes())?;
        let mut out = NativeBuffer::sized(u32::try_from(zwr.len()).unwrap_or(u32::MAX));
        input.zwr2str(self, &mut out)?;
        out.value()
    }

    /// Quotes `bytes` for display: canonical numbers bare, everything else in ZWRITE format.
    pub fn quote(&self, bytes: &[u8]) -> ClientResult<String> {
        self.str2zwr(bytes)
    }

    /// Returns the engine's message text for `status`.
    pub fn message(&self, status: i32) -> ClientResult<String> {
        let mut out = NativeBuffer::sized(MAX_ERRORMSG);
        let code = RetryableCall::new(self, "message")
            .run_value(&mut out, |engine, tptoken, errstr, ret| engine.message(tptoken, errstr, status, ret))?;
        self.check(code)?;
        out.value_lossy()
    }

    /// Deletes every local variable except `names`. No names deletes all locals.
    pub fn kill_locals_except(&self, names: &[&str]) -> ClientResult<()> {
        BufferSet::from_values(names)?.delete_excl(self)
    }

    /// Deletes every local variable.
    pub fn kill_all_locals(&self) -> ClientResult<()> {
        self.kill_locals_except(&[])
    }

    /// Releases every lock this thread holds, then acquires locks on all `nodes`.
    ///
    /// Waits up to `timeout`; returns `false` if the locks could not be acquired in time.
    pub fn lock(&self, timeout: Duration, nodes: &[&Node<'_>]) -> ClientResult<bool> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let timeout_slots = if cfg!(target_pointer_width = "64") { 1 } else { 2 };
        let mut call = VariadicCall::new(self, timeout_slots + 1 + 3 * nodes.len())?;
        call.push_u64(timeout_ns)?;
        call.push_usize(nodes.len())?;
        for node in nodes {
            let (varname, subs) = node.key_descs();
            call.push_desc(varname)?;
            call.push_usize(subs.len())?;
            call.push_descs(subs)?;
        }
        match call.invoke(VariadicEntry::Lock) {
            OK => Ok(true),
            LOCK_TIMEOUT => Ok(false),
            status => Err(self.error(status)),
        }
    }

    /// Runs `f` in a transaction labelled `transid`.
    ///
    /// `locals` are restored to their values at transaction start whenever the
    /// engine restarts the transaction; a single `"*"` restores every local.
    /// Returns `true` on commit and `false` on rollback.
    ///
    /// `f` may be invoked more than once, so it should have no effects outside
    /// the engine beyond what it can safely repeat.
    pub fn transaction<F>(&self, transid: &str, locals: &[&str], f: F) -> ClientResult<bool>
    where
        F: FnMut(&Conn) -> ClientResult<TxnOutcome>,
    {
        BufferSet::from_values(locals)?.tp(self, transid, f)
    }

    /// Runs a transaction that relaxes durability (transaction id `"BATCH"`).
    pub fn transaction_fast<F>(&self, locals: &[&str], f: F) -> ClientResult<bool>
    where
        F: FnMut(&Conn) -> ClientResult<TxnOutcome>,
    {
        self.transaction("BATCH", locals, f)
    }

    /// Invokes the call-in routine `routine` with `args` and returns its result.
    ///
    /// The result must fit the configured call-in return capacity; call-ins are
    /// not retried.
    pub fn call_in(&self, routine: &str, args: &[&[u8]]) -> ClientResult<Vec<u8>> {
        if args.len() + 2 > MAX_PARAMS {
            return Err(ClientError::ArgumentOverflow {
                count: args.len() + 2,
                max: MAX_PARAMS,
            });
        }
        let name = NativeBuffer::from_value(routine.as_bytes())?;
        let inputs = args
            .iter()
            .map(|a| NativeBuffer::from_value(a))
            .collect::<ClientResult<Vec<_>>>()?;
        let mut ret = NativeBuffer::sized(self.config.call_in_return_capacity);

        let status = {
            let mut call = VariadicCall::new(self, args.len() + 2)?;
            call.push_desc(name.desc()?)?;
            call.push_desc_mut(ret.desc_mut()?)?;
            for input in &inputs {
                call.push_desc(input.desc()?)?;
            }
            call.invoke(VariadicEntry::CallIn)
        };
        if status == INVSTRLEN && ret.len_used()? > ret.len_alloc()? {
            return Err(ClientError::CapacityExceeded {
                required: ret.len_used()?,
                capacity: ret.len_alloc()?,
            });
        }
        self.check(status)?;
        ret.value()
    }
}

/// Extracts the message text from `"<code>,(<entry>),<text>"` if `<code>` matches `status`.
fn parse_errstr(raw: &[u8], status: i32) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    let (code, rest) = text.split_once(',')?;
    if code.parse::<u32>().ok()? != status.unsigned_abs() {
        return None;
    }
    let (_, message) = rest.split_once("),")?;
    Some(message.to_owned())
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("tptoken", &self.tptoken)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
