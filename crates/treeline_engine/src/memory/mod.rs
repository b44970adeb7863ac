//! In-memory reference engine for testing.

pub mod collate;
mod locks;
mod store;
pub mod zwr;

use crate::abi::{
    BufferDesc, DeleteKind, ParamBlock, TpFn, VariadicEntry, MAX_NAMES, MAX_PARAMS, MAX_STR,
    MAX_SUBSCRIPTS, MAX_TIME_NS, MAX_VARNAME_LEN, NOTTP,
};
use crate::engine::Engine;
use crate::numeric;
use crate::status::{
    self, CALLINAFTERXIT, CINOENTRY, GVUNDEF, INSUFFSUBS, INVLNPAIRLIST, INVSTRLEN, INVTPTRANS,
    INVVARNAME, INVZWRITECHAR, LOCK_TIMEOUT, LVUNDEF, MAXNRSUBSCRIPTS, NAMECOUNT2HI, NODEEND,
    NUMOFLOW, OK, PARAMINVALID, PARMOFLOW, TIME2LONG, TPRETRYLIMIT, TP_RESTART, TP_ROLLBACK,
    UNKNOWNSYSERR, VARNAME2LONG,
};
use collate::Sub;
use locks::{LockName, LockTable};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use store::{Path, Store};
use tracing::{debug, trace};

/// A call-in routine: receives argument values, returns the result value or a status.
pub type Routine = Arc<dyn Fn(&[Vec<u8>]) -> Result<Vec<u8>, i32> + Send + Sync>;

/// Status plus detail text destined for the error string.
type Fallible<T> = Result<T, (i32, String)>;

fn fail<T>(status: i32, detail: impl Into<String>) -> Fallible<T> {
    Err((status, detail.into()))
}

/// Configuration for [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Restarts a single transaction may take before `TPRETRYLIMIT`.
    pub max_tp_restarts: u32,

    /// Number of upcoming commits that fail and re-invoke the transaction callback.
    pub forced_commit_failures: u32,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            max_tp_restarts: 16,
            forced_commit_failures: 0,
        }
    }
}

impl MemoryEngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the restart limit.
    #[must_use]
    pub const fn max_tp_restarts(mut self, value: u32) -> Self {
        self.max_tp_restarts = value;
        self
    }

    /// Sets the number of forced commit failures.
    #[must_use]
    pub const fn forced_commit_failures(mut self, value: u32) -> Self {
        self.forced_commit_failures = value;
        self
    }
}

/// An in-memory engine.
///
/// Suitable for:
/// - Unit and scenario tests of the client layer
/// - Benchmarks that should not measure storage
///
/// # Thread Safety
///
/// All state sits behind locks, so one engine can be shared across threads.
/// Transactions are serialized: a thread inside `tp` excludes other threads'
/// transactions (nested transactions on the same thread are allowed).
pub struct MemoryEngine {
    config: MemoryEngineConfig,
    store: Mutex<Store>,
    locks: LockTable,
    routines: Mutex<HashMap<Vec<u8>, Routine>>,
    tp_gate: ReentrantMutex<()>,
    active_tokens: Mutex<Vec<u64>>,
    next_token: AtomicU64,
    commit_failures: AtomicU32,
    exited: AtomicBool,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("config", &self.config)
            .field("routines", &self.routines.lock().len())
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_config(MemoryEngineConfig::default())
    }
}

struct ActiveToken<'a> {
    tokens: &'a Mutex<Vec<u64>>,
    token: u64,
}

impl Drop for ActiveToken<'_> {
    fn drop(&mut self) {
        self.tokens.lock().retain(|&t| t != self.token);
    }
}

impl MemoryEngine {
    /// Creates an empty engine with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty engine.
    #[must_use]
    pub fn with_config(config: MemoryEngineConfig) -> Self {
        Self {
            commit_failures: AtomicU32::new(config.forced_commit_failures),
            config,
            store: Mutex::new(Store::default()),
            locks: LockTable::default(),
            routines: Mutex::new(HashMap::new()),
            tp_gate: ReentrantMutex::new(()),
            active_tokens: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            exited: AtomicBool::new(false),
        }
    }

    /// Registers a call-in routine under `name`, replacing any previous one.
    pub fn register_routine<F>(&self, name: impl Into<Vec<u8>>, routine: F)
    where
        F: Fn(&[Vec<u8>]) -> Result<Vec<u8>, i32> + Send + Sync + 'static,
    {
        self.routines.lock().insert(name.into(), Arc::new(routine));
    }

    /// Makes the next `count` commits fail, re-invoking their callbacks.
    pub fn fail_next_commits(&self, count: u32) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// Returns the lock count the calling thread holds on a resource.
    pub fn lock_count(&self, varname: &[u8], subs: &[&[u8]]) -> u32 {
        let name = (varname.to_vec(), subs.iter().map(|s| s.to_vec()).collect());
        self.locks.count(thread::current().id(), &name)
    }

    /// Returns true once [`Engine::exit`] has been called.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn enter(&self, tptoken: u64) -> Fallible<()> {
        if self.has_exited() {
            return fail(CALLINAFTERXIT, "");
        }
        if tptoken != NOTTP && !self.active_tokens.lock().contains(&tptoken) {
            return fail(INVTPTRANS, format!("token {tptoken}"));
        }
        Ok(())
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn report(errstr: Option<&mut BufferDesc>, entry: &str, result: Fallible<i32>) -> i32 {
    match result {
        Ok(status) => status,
        Err((status, detail)) => {
            if let Some(errstr) = errstr {
                write_errstr(errstr, status, entry, &detail);
            }
            status
        }
    }
}

fn write_errstr(errstr: &mut BufferDesc, status: i32, entry: &str, detail: &str) {
    if errstr.is_null() {
        return;
    }
    let text = status::format_errstr(status, entry, detail);
    let n = text.len().min(errstr.len_alloc as usize);
    // SAFETY: the caller supplied `len_alloc` writable bytes at `buf_addr`.
    unsafe { std::ptr::copy_nonoverlapping(text.as_ptr(), errstr.buf_addr, n) };
    errstr.len_used = n as u32;
}

fn input(desc: &BufferDesc) -> Fallible<&[u8]> {
    // SAFETY: descriptors handed to the engine reference `len_used` readable bytes.
    unsafe { desc.input() }.map_err(|s| (s, String::new()))
}

fn output(ret: &mut BufferDesc, bytes: &[u8]) -> Fallible<i32> {
    if ret.is_null() && ret.len_alloc > 0 {
        return fail(PARAMINVALID, "null output buffer");
    }
    // SAFETY: output descriptors reference `len_alloc` writable bytes.
    if unsafe { ret.fill(bytes) } {
        Ok(OK)
    } else {
        fail(INVSTRLEN, format!("{} bytes needed, {} available", bytes.len(), ret.len_alloc))
    }
}

fn validate_name(name: &[u8], allow_global: bool) -> Fallible<()> {
    let bare = match name.strip_prefix(b"^") {
        Some(rest) if allow_global => rest,
        Some(_) => return fail(INVVARNAME, String::from_utf8_lossy(name)),
        None => name,
    };
    let well_formed = match bare.split_first() {
        Some((&first, rest)) => {
            (first == b'%' || first.is_ascii_alphabetic()) && rest.iter().all(u8::is_ascii_alphanumeric)
        }
        None => false,
    };
    if !well_formed {
        return fail(INVVARNAME, String::from_utf8_lossy(name));
    }
    if bare.len() > MAX_VARNAME_LEN {
        return fail(VARNAME2LONG, String::from_utf8_lossy(name));
    }
    Ok(())
}

fn decode_key(varname: &BufferDesc, subs: &[BufferDesc]) -> Fallible<(Vec<u8>, Path)> {
    let name = input(varname)?.to_vec();
    validate_name(&name, true)?;
    if subs.len() > MAX_SUBSCRIPTS {
        return fail(MAXNRSUBSCRIPTS, format!("{} subscripts", subs.len()));
    }
    let path = subs
        .iter()
        .map(|d| input(d).map(Sub::new))
        .collect::<Fallible<Path>>()?;
    Ok((name, path))
}

fn decode_names(names: &[BufferDesc]) -> Fallible<Vec<Vec<u8>>> {
    if names.len() > MAX_NAMES {
        return fail(NAMECOUNT2HI, format!("{} names", names.len()));
    }
    names.iter().map(|d| input(d).map(<[u8]>::to_vec)).collect()
}

fn describe(name: &[u8], path: &[Sub]) -> String {
    let mut out = String::from_utf8_lossy(name).into_owned();
    if !path.is_empty() {
        let subs: Vec<String> = path
            .iter()
            .map(|s| String::from_utf8_lossy(&zwr::encode(s.as_bytes())).into_owned())
            .collect();
        out.push('(');
        out.push_str(&subs.join(","));
        out.push(')');
    }
    out
}

fn undefined(name: &[u8], path: &[Sub]) -> (i32, String) {
    let status = if name.first() == Some(&b'^') { GVUNDEF } else { LVUNDEF };
    (status, describe(name, path))
}

fn lock_name(varname: &BufferDesc, subs: &[BufferDesc]) -> Fallible<LockName> {
    let (name, path) = decode_key(varname, subs)?;
    Ok((name, path.into_iter().map(|s| s.as_bytes().to_vec()).collect()))
}

/// # Safety
///
/// `addr` must be null or point to a valid descriptor.
unsafe fn desc_at<'a>(addr: usize) -> Fallible<&'a BufferDesc> {
    (addr as *const BufferDesc)
        .as_ref()
        .ok_or_else(|| (PARAMINVALID, "null descriptor".to_owned()))
}

#[cfg(target_pointer_width = "64")]
fn split_timeout(args: &[usize]) -> Option<(u64, &[usize])> {
    let (&timeout, rest) = args.split_first()?;
    Some((timeout as u64, rest))
}

#[cfg(not(target_pointer_width = "64"))]
fn split_timeout(args: &[usize]) -> Option<(u64, &[usize])> {
    if args.len() < 2 {
        return None;
    }
    let (a, b) = (args[0] as u64, args[1] as u64);
    let timeout = if cfg!(target_endian = "little") {
        a | (b << 32)
    } else {
        (a << 32) | b
    };
    Some((timeout, &args[2..]))
}

impl MemoryEngine {
    fn get_value(&self, tptoken: u64, varname: &BufferDesc, subs: &[BufferDesc], ret: &mut BufferDesc) -> Fallible<i32> {
        self.enter(tptoken)?;
        let (name, path) = decode_key(varname, subs)?;
        let store = self.store.lock();
        let value = store.get(&name, &path).ok_or_else(|| undefined(&name, &path))?;
        output(ret, value)
    }

    fn set_value(&self, tptoken: u64, varname: &BufferDesc, subs: &[BufferDesc], value: &BufferDesc) -> Fallible<i32> {
        self.enter(tptoken)?;
        let (name, path) = decode_key(varname, subs)?;
        let value = input(value)?;
        if value.len() > MAX_STR as usize {
            return fail(INVSTRLEN, format!("value of {} bytes", value.len()));
        }
        self.store.lock().set(&name, path, value.to_vec());
        Ok(OK)
    }

    fn increment(
        &self,
        tptoken: u64,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        increment: Option<&BufferDesc>,
        ret: &mut BufferDesc,
    ) -> Fallible<i32> {
        self.enter(tptoken)?;
        let (name, path) = decode_key(varname, subs)?;
        let by = match increment {
            Some(d) => input(d)?.to_vec(),
            None => b"1".to_vec(),
        };
        let result = {
            let mut store = self.store.lock();
            let current = store.get(&name, &path).unwrap_or_default();
            let sum = numeric::add(current, &by).ok_or_else(|| (NUMOFLOW, describe(&name, &path)))?;
            store.set(&name, path, sum.clone().into_bytes());
            sum
        };
        output(ret, result.as_bytes())
    }

    fn step_subscript(
        &self,
        tptoken: u64,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
        reverse: bool,
    ) -> Fallible<i32> {
        self.enter(tptoken)?;
        let (name, path) = decode_key(varname, subs)?;
        let found = {
            let store = self.store.lock();
            if path.is_empty() {
                store.name_step(&name, reverse)
            } else {
                store.subscript_step(&name, &path, reverse)
            }
        };
        match found {
            Some(sub) => output(ret, &sub),
            None => fail(NODEEND, ""),
        }
    }

    fn step_node(
        &self,
        tptoken: u64,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret_subs_used: &mut u32,
        ret_subs: &mut [BufferDesc],
        reverse: bool,
    ) -> Fallible<i32> {
        self.enter(tptoken)?;
        let (name, path) = decode_key(varname, subs)?;
        let found = {
            let store = self.store.lock();
            if reverse {
                store.node_previous(&name, &path)
            } else {
                store.node_next(&name, &path)
            }
        };
        let Some(found) = found else {
            return fail(NODEEND, "");
        };
        let usable = (*ret_subs_used as usize).min(ret_subs.len());
        if found.len() > usable {
            *ret_subs_used = found.len() as u32;
            return fail(INSUFFSUBS, format!("{} subscripts needed, {usable} available", found.len()));
        }
        for (i, (sub, slot)) in found.iter().zip(ret_subs.iter_mut()).enumerate() {
            if let Err(err) = output(slot, sub.as_bytes()) {
                *ret_subs_used = i as u32;
                return Err(err);
            }
        }
        *ret_subs_used = found.len() as u32;
        Ok(OK)
    }

    fn run_tp(
        &self,
        tptoken: u64,
        errstr: *mut BufferDesc,
        tpfn: TpFn,
        param: *mut c_void,
        transid: &CStr,
        names: &[BufferDesc],
    ) -> Fallible<i32> {
        self.enter(tptoken)?;
        let names = decode_names(names)?;
        let restore_all = names.len() == 1 && names[0] == b"*";
        if !restore_all {
            for name in &names {
                validate_name(name, false)?;
            }
        }
        let transid = transid.to_string_lossy();
        let batch = transid.eq_ignore_ascii_case("BATCH") || transid.eq_ignore_ascii_case("BA");

        let _gate = self.tp_gate.lock();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.active_tokens.lock().push(token);
        let _active = ActiveToken {
            tokens: &self.active_tokens,
            token,
        };

        let saved_locals = self
            .store
            .lock()
            .locals(if restore_all { None } else { Some(names.as_slice()) });
        let mut restarts = 0u32;
        loop {
            let saved_globals = self.store.lock().globals();
            // SAFETY: `tpfn` and `param` come from the caller as a matched pair.
            let status = unsafe { tpfn(token, errstr, param) };
            match status {
                OK if !self.take_commit_failure() => {
                    trace!(token, batch, "transaction committed");
                    return Ok(OK);
                }
                OK => debug!(token, "commit failed, re-invoking transaction"),
                TP_RESTART => debug!(token, restarts, "transaction restart requested"),
                TP_ROLLBACK => {
                    self.store.lock().restore_globals(saved_globals);
                    return Ok(TP_ROLLBACK);
                }
                other => {
                    self.store.lock().restore_globals(saved_globals);
                    return if other < 0 {
                        fail(other, transid.into_owned())
                    } else {
                        Ok(other)
                    };
                }
            }
            {
                let mut store = self.store.lock();
                store.restore_globals(saved_globals);
                store.restore_locals(&saved_locals, restore_all);
            }
            restarts += 1;
            if restarts > self.config.max_tp_restarts {
                return fail(TPRETRYLIMIT, format!("{restarts} restarts"));
            }
        }
    }

    unsafe fn variadic_lock(&self, tptoken: u64, plist: &ParamBlock) -> Fallible<i32> {
        self.enter(tptoken)?;
        if plist.n < 0 || plist.n as usize > MAX_PARAMS {
            return fail(PARMOFLOW, format!("{} parameters", plist.n));
        }
        let (timeout, rest) = split_timeout(plist.used()).ok_or_else(|| (INVLNPAIRLIST, String::new()))?;
        if timeout > MAX_TIME_NS {
            return fail(TIME2LONG, format!("{timeout} ns"));
        }
        let (&count, triples) = rest.split_first().ok_or_else(|| (INVLNPAIRLIST, String::new()))?;
        if triples.len() != count.saturating_mul(3) {
            return fail(INVLNPAIRLIST, format!("{count} names, {} slots", triples.len()));
        }
        let mut names = Vec::with_capacity(count);
        for triple in triples.chunks_exact(3) {
            let varname = desc_at(triple[0])?;
            let subs: &[BufferDesc] = if triple[1] == 0 {
                &[]
            } else if triple[2] == 0 {
                return fail(PARAMINVALID, "null subscript array");
            } else {
                std::slice::from_raw_parts(triple[2] as *const BufferDesc, triple[1])
            };
            names.push(lock_name(varname, subs)?);
        }
        let acquired = self
            .locks
            .replace_all(thread::current().id(), names, Duration::from_nanos(timeout));
        Ok(if acquired { OK } else { LOCK_TIMEOUT })
    }

    unsafe fn variadic_call_in(&self, tptoken: u64, plist: &ParamBlock) -> Fallible<i32> {
        self.enter(tptoken)?;
        if plist.n < 0 || plist.n as usize > MAX_PARAMS {
            return fail(PARMOFLOW, format!("{} parameters", plist.n));
        }
        let args = plist.used();
        if args.len() < 2 {
            return fail(PARAMINVALID, "missing routine name or return buffer");
        }
        let name = input(desc_at(args[0])?)?.to_vec();
        let ret = (args[1] as *mut BufferDesc).as_mut();
        let inputs = args[2..]
            .iter()
            .map(|&a| desc_at(a).and_then(input).map(<[u8]>::to_vec))
            .collect::<Fallible<Vec<_>>>()?;
        let routine = self
            .routines
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| (CINOENTRY, String::from_utf8_lossy(&name).into_owned()))?;
        let result = routine(&inputs).map_err(|s| (s, String::from_utf8_lossy(&name).into_owned()))?;
        match ret {
            Some(ret) => output(ret, &result),
            None => Ok(OK),
        }
    }
}

impl Engine for MemoryEngine {
    fn get(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32 {
        report(errstr, "get", self.get_value(tptoken, varname, subs, ret))
    }

    fn set(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        value: &BufferDesc,
    ) -> i32 {
        report(errstr, "set", self.set_value(tptoken, varname, subs, value))
    }

    fn data(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut u32,
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let (name, path) = decode_key(varname, subs)?;
            *ret = self.store.lock().data(&name, &path);
            Ok(OK)
        });
        report(errstr, "data", result)
    }

    fn delete(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        kind: DeleteKind,
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let (name, path) = decode_key(varname, subs)?;
            let mut store = self.store.lock();
            match kind {
                DeleteKind::Node => store.kill_node(&name, &path),
                DeleteKind::Tree => store.kill_tree(&name, &path),
            }
            Ok(OK)
        });
        report(errstr, "delete", result)
    }

    fn delete_excl(&self, tptoken: u64, errstr: Option<&mut BufferDesc>, names: &[BufferDesc]) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let keep = decode_names(names)?;
            for name in &keep {
                validate_name(name, false)?;
            }
            self.store.lock().kill_locals_except(&keep);
            Ok(OK)
        });
        report(errstr, "delete_excl", result)
    }

    fn incr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        increment: Option<&BufferDesc>,
        ret: &mut BufferDesc,
    ) -> i32 {
        report(errstr, "incr", self.increment(tptoken, varname, subs, increment, ret))
    }

    fn subscript_next(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32 {
        report(errstr, "subscript_next", self.step_subscript(tptoken, varname, subs, ret, false))
    }

    fn subscript_previous(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32 {
        report(errstr, "subscript_previous", self.step_subscript(tptoken, varname, subs, ret, true))
    }

    fn node_next(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret_subs_used: &mut u32,
        ret_subs: &mut [BufferDesc],
    ) -> i32 {
        let result = self.step_node(tptoken, varname, subs, ret_subs_used, ret_subs, false);
        report(errstr, "node_next", result)
    }

    fn node_previous(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret_subs_used: &mut u32,
        ret_subs: &mut [BufferDesc],
    ) -> i32 {
        let result = self.step_node(tptoken, varname, subs, ret_subs_used, ret_subs, true);
        report(errstr, "node_previous", result)
    }

    fn lock_incr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        timeout_ns: u64,
        varname: &BufferDesc,
        subs: &[BufferDesc],
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            if timeout_ns > MAX_TIME_NS {
                return fail(TIME2LONG, format!("{timeout_ns} ns"));
            }
            let name = lock_name(varname, subs)?;
            let acquired = self
                .locks
                .incr(thread::current().id(), name, Duration::from_nanos(timeout_ns));
            Ok(if acquired { OK } else { LOCK_TIMEOUT })
        });
        report(errstr, "lock_incr", result)
    }

    fn lock_decr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let name = lock_name(varname, subs)?;
            self.locks.decr(thread::current().id(), &name);
            Ok(OK)
        });
        report(errstr, "lock_decr", result)
    }

    fn str2zwr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        input_desc: &BufferDesc,
        out: &mut BufferDesc,
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let encoded = zwr::encode(input(input_desc)?);
            output(out, &encoded)
        });
        report(errstr, "str2zwr", result)
    }

    fn zwr2str(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        input_desc: &BufferDesc,
        out: &mut BufferDesc,
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let raw = input(input_desc)?;
            let decoded = zwr::decode(raw)
                .ok_or_else(|| (INVZWRITECHAR, String::from_utf8_lossy(raw).into_owned()))?;
            output(out, &decoded)
        });
        report(errstr, "zwr2str", result)
    }

    fn message(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        code: i32,
        out: &mut BufferDesc,
    ) -> i32 {
        let result = self.enter(tptoken).and_then(|()| {
            let text = status::message(code).ok_or_else(|| (UNKNOWNSYSERR, code.to_string()))?;
            output(out, text.as_bytes())
        });
        report(errstr, "message", result)
    }

    fn tp(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        tpfn: TpFn,
        param: *mut c_void,
        transid: &CStr,
        names: &[BufferDesc],
    ) -> i32 {
        let errstr: *mut BufferDesc = match errstr {
            Some(e) => e,
            None => std::ptr::null_mut(),
        };
        let result = self.run_tp(tptoken, errstr, tpfn, param, transid, names);
        // SAFETY: `errstr` was derived from the caller's exclusive borrow above.
        report(unsafe { errstr.as_mut() }, "tp", result)
    }

    unsafe fn call_variadic(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        entry: VariadicEntry,
        plist: &ParamBlock,
    ) -> i32 {
        match entry {
            VariadicEntry::Lock => report(errstr, "lock", self.variadic_lock(tptoken, plist)),
            VariadicEntry::CallIn => report(errstr, "call_in", self.variadic_call_in(tptoken, plist)),
        }
    }

    fn exit(&self) -> i32 {
        if !self.exited.swap(true, Ordering::AcqRel) {
            debug!("engine run down");
        }
        OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn input_desc(bytes: &[u8]) -> BufferDesc {
        BufferDesc {
            len_alloc: bytes.len() as u32,
            len_used: bytes.len() as u32,
            buf_addr: bytes.as_ptr().cast_mut(),
        }
    }

    fn output_desc(storage: &mut [u8]) -> BufferDesc {
        BufferDesc {
            len_alloc: storage.len() as u32,
            len_used: 0,
            buf_addr: storage.as_mut_ptr(),
        }
    }

    fn set(engine: &MemoryEngine, tptoken: u64, name: &str, subs: &[&str], value: &str) -> i32 {
        let subs: Vec<BufferDesc> = subs.iter().map(|s| input_desc(s.as_bytes())).collect();
        engine.set(tptoken, None, &input_desc(name.as_bytes()), &subs, &input_desc(value.as_bytes()))
    }

    fn get(engine: &MemoryEngine, name: &str, subs: &[&str]) -> Result<String, i32> {
        let subs: Vec<BufferDesc> = subs.iter().map(|s| input_desc(s.as_bytes())).collect();
        let mut storage = vec![0u8; 256];
        let mut ret = output_desc(&mut storage);
        match engine.get(NOTTP, None, &input_desc(name.as_bytes()), &subs, &mut ret) {
            OK => Ok(String::from_utf8_lossy(&storage[..ret.len_used as usize]).into_owned()),
            status => Err(status),
        }
    }

    #[test]
    fn set_then_get() {
        let engine = MemoryEngine::new();
        assert_eq!(set(&engine, NOTTP, "^hello", &["world"], "Go world"), OK);
        assert_eq!(get(&engine, "^hello", &["world"]).as_deref(), Ok("Go world"));
    }

    #[test]
    fn undefined_writes_errstr() {
        let engine = MemoryEngine::new();
        let mut storage = vec![0u8; 128];
        let mut errstr = output_desc(&mut storage);
        let mut ret = BufferDesc::empty();
        let status = engine.get(NOTTP, Some(&mut errstr), &input_desc(b"^nope"), &[], &mut ret);
        assert_eq!(status, GVUNDEF);
        let text = String::from_utf8_lossy(&storage[..errstr.len_used as usize]).into_owned();
        assert!(text.contains("(get),%TKV-E-GVUNDEF"), "{text}");
        assert_eq!(get(&engine, "nope", &[]), Err(LVUNDEF));
    }

    #[test]
    fn errstr_is_truncated_to_capacity() {
        let engine = MemoryEngine::new();
        let mut storage = vec![0u8; 8];
        let mut errstr = output_desc(&mut storage);
        let mut ret = BufferDesc::empty();
        engine.get(NOTTP, Some(&mut errstr), &input_desc(b"^nope"), &[], &mut ret);
        assert_eq!(errstr.len_used, 8);
    }

    #[test]
    fn small_ret_reports_required_length() {
        let engine = MemoryEngine::new();
        set(&engine, NOTTP, "x", &[], "hello world");
        let mut storage = [0u8; 4];
        let mut ret = output_desc(&mut storage);
        assert_eq!(engine.get(NOTTP, None, &input_desc(b"x"), &[], &mut ret), INVSTRLEN);
        assert_eq!(ret.len_used, 11);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let engine = MemoryEngine::new();
        assert_eq!(set(&engine, NOTTP, "", &[], "v"), INVVARNAME);
        assert_eq!(set(&engine, NOTTP, "1abc", &[], "v"), INVVARNAME);
        assert_eq!(set(&engine, NOTTP, "^", &[], "v"), INVVARNAME);
        assert_eq!(set(&engine, NOTTP, &"a".repeat(32), &[], "v"), VARNAME2LONG);
        assert_eq!(set(&engine, NOTTP, "%ok", &[], "v"), OK);
        let subs: Vec<String> = (0..32).map(|i| i.to_string()).collect();
        let subs: Vec<&str> = subs.iter().map(String::as_str).collect();
        assert_eq!(set(&engine, NOTTP, "x", &subs, "v"), MAXNRSUBSCRIPTS);
    }

    #[test]
    fn node_next_reports_insuffsubs_then_invstrlen() {
        let engine = MemoryEngine::new();
        set(&engine, NOTTP, "^t", &["a", "long subscript"], "v");

        let mut used = 1;
        let mut slots = [BufferDesc::empty(); 1];
        let status = engine.node_next(NOTTP, None, &input_desc(b"^t"), &[], &mut used, &mut slots);
        assert_eq!(status, INSUFFSUBS);
        assert_eq!(used, 2);

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut slots = [output_desc(&mut a), output_desc(&mut b)];
        let mut used = 2;
        let status = engine.node_next(NOTTP, None, &input_desc(b"^t"), &[], &mut used, &mut slots);
        assert_eq!(status, INVSTRLEN);
        assert_eq!(used, 1);
        assert_eq!(slots[1].len_used, 14);
    }

    #[test]
    fn incr_is_numeric() {
        let engine = MemoryEngine::new();
        let mut storage = [0u8; 16];
        let mut ret = output_desc(&mut storage);
        let by = input_desc(b"2.5");
        assert_eq!(engine.incr(NOTTP, None, &input_desc(b"n"), &[], Some(&by), &mut ret), OK);
        assert_eq!(engine.incr(NOTTP, None, &input_desc(b"n"), &[], None, &mut ret), OK);
        assert_eq!(&storage[..ret.len_used as usize], b"3.5");
    }

    struct TpContext<'a> {
        engine: &'a MemoryEngine,
        calls: Cell<u32>,
        seen: Cell<u32>,
        outcome: i32,
    }

    unsafe extern "C" fn callback(tptoken: u64, _errstr: *mut BufferDesc, param: *mut c_void) -> i32 {
        let ctx = &*(param as *const TpContext<'_>);
        ctx.calls.set(ctx.calls.get() + 1);
        if get(ctx.engine, "local", &[]).as_deref() == Ok("before") {
            ctx.seen.set(ctx.seen.get() + 1);
        }
        set(ctx.engine, tptoken, "local", &[], "during");
        set(ctx.engine, tptoken, "^g", &[], "during");
        if ctx.outcome == TP_RESTART && ctx.calls.get() >= 3 {
            return OK;
        }
        ctx.outcome
    }

    fn run(engine: &MemoryEngine, outcome: i32, names: &[&[u8]]) -> (i32, u32, u32) {
        let ctx = TpContext {
            engine,
            calls: Cell::new(0),
            seen: Cell::new(0),
            outcome,
        };
        let names: Vec<BufferDesc> = names.iter().map(|n| input_desc(n)).collect();
        let status = engine.tp(
            NOTTP,
            None,
            callback,
            std::ptr::addr_of!(ctx) as *mut c_void,
            c"test",
            &names,
        );
        (status, ctx.calls.get(), ctx.seen.get())
    }

    #[test]
    fn tp_restart_restores_named_locals() {
        let engine = MemoryEngine::new();
        set(&engine, NOTTP, "local", &[], "before");
        let (status, calls, seen) = run(&engine, TP_RESTART, &[b"local"]);
        assert_eq!(status, OK);
        assert_eq!(calls, 3);
        assert_eq!(seen, 3);
        assert_eq!(get(&engine, "local", &[]).as_deref(), Ok("during"));
    }

    #[test]
    fn tp_rollback_reverts_globals() {
        let engine = MemoryEngine::new();
        set(&engine, NOTTP, "^g", &[], "before");
        let (status, calls, _) = run(&engine, TP_ROLLBACK, &[]);
        assert_eq!(status, TP_ROLLBACK);
        assert_eq!(calls, 1);
        assert_eq!(get(&engine, "^g", &[]).as_deref(), Ok("before"));
        assert_eq!(get(&engine, "local", &[]).as_deref(), Ok("during"));
    }

    #[test]
    fn forced_commit_failure_reinvokes() {
        let engine = MemoryEngine::with_config(MemoryEngineConfig::new().forced_commit_failures(2));
        set(&engine, NOTTP, "local", &[], "before");
        let (status, calls, seen) = run(&engine, OK, &[b"*"]);
        assert_eq!(status, OK);
        assert_eq!(calls, 3);
        assert_eq!(seen, 3);
    }

    #[test]
    fn restart_limit_is_enforced() {
        let engine = MemoryEngine::with_config(MemoryEngineConfig::new().max_tp_restarts(1));
        let (status, calls, _) = run(&engine, TP_RESTART, &[]);
        assert_eq!(status, TPRETRYLIMIT);
        assert_eq!(calls, 2);
    }

    #[test]
    fn stale_token_is_rejected() {
        let engine = MemoryEngine::new();
        assert_eq!(set(&engine, 99, "x", &[], "v"), INVTPTRANS);
    }

    #[test]
    fn variadic_lock_replaces_held_locks() {
        let engine = MemoryEngine::new();
        let a = input_desc(b"^a");
        let b = input_desc(b"^b");
        let sub = [input_desc(b"1")];
        assert_eq!(engine.lock_incr(NOTTP, None, 0, &a, &[]), OK);

        let mut plist = ParamBlock::new();
        let slots = [
            0,
            2,
            std::ptr::addr_of!(a) as usize,
            0,
            0,
            std::ptr::addr_of!(b) as usize,
            1,
            sub.as_ptr() as usize,
        ];
        #[cfg(not(target_pointer_width = "64"))]
        let slots = {
            let mut wide = vec![0usize];
            wide.extend_from_slice(&slots);
            wide
        };
        plist.args[..slots.len()].copy_from_slice(&slots);
        plist.n = slots.len() as isize;
        assert_eq!(unsafe { engine.call_variadic(NOTTP, None, VariadicEntry::Lock, &plist) }, OK);
        assert_eq!(engine.lock_count(b"^a", &[]), 1);
        assert_eq!(engine.lock_count(b"^b", &[b"1"]), 1);

        plist.n -= 1;
        assert_eq!(
            unsafe { engine.call_variadic(NOTTP, None, VariadicEntry::Lock, &plist) },
            INVLNPAIRLIST
        );
    }

    #[test]
    fn lock_times_out_across_threads() {
        let engine = Arc::new(MemoryEngine::new());
        assert_eq!(engine.lock_incr(NOTTP, None, 0, &input_desc(b"^l"), &[]), OK);
        let other = Arc::clone(&engine);
        let status = thread::spawn(move || other.lock_incr(NOTTP, None, 10_000_000, &input_desc(b"^l"), &[]))
            .join()
            .unwrap();
        assert_eq!(status, LOCK_TIMEOUT);
        assert_eq!(engine.lock_incr(NOTTP, None, MAX_TIME_NS + 1, &input_desc(b"^l"), &[]), TIME2LONG);
    }

    #[test]
    fn call_in_invokes_registered_routine() {
        let engine = MemoryEngine::new();
        engine.register_routine("concat", |args: &[Vec<u8>]| Ok(args.concat()));
        let name = input_desc(b"concat");
        let x = input_desc(b"ab");
        let y = input_desc(b"cd");
        let mut storage = [0u8; 8];
        let mut ret = output_desc(&mut storage);

        let mut plist = ParamBlock::new();
        plist.args[0] = std::ptr::addr_of!(name) as usize;
        plist.args[1] = std::ptr::addr_of_mut!(ret) as usize;
        plist.args[2] = std::ptr::addr_of!(x) as usize;
        plist.args[3] = std::ptr::addr_of!(y) as usize;
        plist.n = 4;
        assert_eq!(unsafe { engine.call_variadic(NOTTP, None, VariadicEntry::CallIn, &plist) }, OK);
        assert_eq!(&storage[..4], b"abcd");

        let missing = input_desc(b"missing");
        plist.args[0] = std::ptr::addr_of!(missing) as usize;
        assert_eq!(
            unsafe { engine.call_variadic(NOTTP, None, VariadicEntry::CallIn, &plist) },
            CINOENTRY
        );
    }

    #[test]
    fn calls_after_exit_fail() {
        let engine = MemoryEngine::new();
        assert_eq!(engine.exit(), OK);
        assert_eq!(engine.exit(), OK);
        assert!(engine.has_exited());
        assert_eq!(set(&engine, NOTTP, "x", &[], "v"), CALLINAFTERXIT);
    }

    #[test]
    fn builder_pattern() {
        let config = MemoryEngineConfig::new().max_tp_restarts(3).forced_commit_failures(1);
        assert_eq!(config.max_tp_restarts, 3);
        assert_eq!(config.forced_commit_failures, 1);
        assert_eq!(MemoryEngineConfig::default().max_tp_restarts, 16);
    }
}
