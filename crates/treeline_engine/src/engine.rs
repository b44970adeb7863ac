//! The engine entry-point trait.

use crate::abi::{BufferDesc, DeleteKind, ParamBlock, TpFn, VariadicEntry};
use std::ffi::{c_void, CStr};

/// The synchronous entry points of a hierarchical key-value engine.
///
/// Every method mirrors one native entry point: it takes the caller's
/// transaction token, an optional error-string buffer and fixed-layout
/// descriptors, and returns a status code from [`crate::status`].
///
/// # Capacity reports
///
/// When an output descriptor is too small the engine stores the required
/// length in its `len_used` and returns `INVSTRLEN`. When an output subscript
/// array is too short, `node_next`/`node_previous` store the required element
/// count in `ret_subs_used` and return `INSUFFSUBS`; if instead one subscript
/// is too long, `ret_subs_used` holds that subscript's index.
///
/// # Descriptors
///
/// Input descriptors must reference `len_used` readable bytes and output
/// descriptors `len_alloc` writable bytes for the duration of the call.
/// Implementations trust this; the client layer upholds it by only passing
/// descriptors it owns.
///
/// # Error strings
///
/// On failure, if `errstr` is supplied, the engine writes a message formatted
/// by [`crate::status::format_errstr`], truncated to `errstr.len_alloc`.
///
/// # Implementors
///
/// - [`crate::MemoryEngine`] - In-memory reference engine
pub trait Engine: Send + Sync {
    /// Fetches the value of a node into `ret`.
    fn get(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32;

    /// Stores `value` at a node.
    fn set(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        value: &BufferDesc,
    ) -> i32;

    /// Reports whether a node has a value (1), a subtree (10), both (11) or neither (0).
    fn data(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut u32,
    ) -> i32;

    /// Deletes a node value, or a node and its subtree.
    fn delete(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        kind: DeleteKind,
    ) -> i32;

    /// Deletes every local variable except those named. An empty list deletes all locals.
    fn delete_excl(&self, tptoken: u64, errstr: Option<&mut BufferDesc>, names: &[BufferDesc]) -> i32;

    /// Atomically adds `increment` (1 when absent) to a node and writes the result into `ret`.
    ///
    /// Not safe to retry: the increment has happened even if `ret` was too small.
    fn incr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        increment: Option<&BufferDesc>,
        ret: &mut BufferDesc,
    ) -> i32;

    /// Finds the next subscript at the same depth; `NODEEND` when there is none.
    fn subscript_next(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32;

    /// Finds the previous subscript at the same depth; `NODEEND` when there is none.
    fn subscript_previous(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret: &mut BufferDesc,
    ) -> i32;

    /// Finds the next node with a value in depth-first order.
    ///
    /// On entry `ret_subs_used` is the number of usable elements of `ret_subs`.
    fn node_next(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret_subs_used: &mut u32,
        ret_subs: &mut [BufferDesc],
    ) -> i32;

    /// Finds the previous node with a value in depth-first order.
    fn node_previous(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
        ret_subs_used: &mut u32,
        ret_subs: &mut [BufferDesc],
    ) -> i32;

    /// Acquires or increments a lock, waiting up to `timeout_ns`.
    fn lock_incr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        timeout_ns: u64,
        varname: &BufferDesc,
        subs: &[BufferDesc],
    ) -> i32;

    /// Decrements a lock count, releasing it at zero.
    fn lock_decr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        varname: &BufferDesc,
        subs: &[BufferDesc],
    ) -> i32;

    /// Encodes `input` in ZWRITE format.
    fn str2zwr(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        input: &BufferDesc,
        out: &mut BufferDesc,
    ) -> i32;

    /// Decodes a ZWRITE-format string; `INVZWRITECHAR` when malformed.
    fn zwr2str(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        input: &BufferDesc,
        out: &mut BufferDesc,
    ) -> i32;

    /// Writes the message text for `status` into `out`.
    fn message(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        status: i32,
        out: &mut BufferDesc,
    ) -> i32;

    /// Runs `tpfn(param)` inside a transaction.
    ///
    /// A return of `OK` commits (re-invoking `tpfn` if the commit fails),
    /// `TP_RESTART` restores the variables named in `names` and invokes
    /// `tpfn` again, and `TP_ROLLBACK` discards the transaction and returns
    /// `TP_ROLLBACK`. A single name `"*"` restores every local.
    fn tp(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        tpfn: TpFn,
        param: *mut c_void,
        transid: &CStr,
        names: &[BufferDesc],
    ) -> i32;

    /// Invokes a variadic entry point with an explicit argument block.
    ///
    /// # Safety
    ///
    /// Every address in `plist` must reference memory valid for the whole call,
    /// laid out as documented on [`VariadicEntry`].
    unsafe fn call_variadic(
        &self,
        tptoken: u64,
        errstr: Option<&mut BufferDesc>,
        entry: VariadicEntry,
        plist: &ParamBlock,
    ) -> i32;

    /// Runs the engine down. Further calls return `CALLINAFTERXIT`.
    fn exit(&self) -> i32;
}
