//! Fixed-layout types shared across the native boundary.

use std::ffi::c_void;

/// Transaction token to use when not inside a transaction callback.
pub const NOTTP: u64 = 0;

/// Longest value, subscript or variable name the engine will hold, in bytes.
pub const MAX_STR: u32 = 1024 * 1024;

/// Most subscripts a single key may carry.
pub const MAX_SUBSCRIPTS: usize = 31;

/// Longest variable name, excluding the leading `^` of a global.
pub const MAX_VARNAME_LEN: usize = 31;

/// Size of an error-string buffer large enough for any engine message.
pub const MAX_ERRORMSG: u32 = 1024;

/// Number of argument slots in a [`ParamBlock`].
pub const MAX_PARAMS: usize = 36;

/// Most variable names accepted by `delete_excl` and `tp`.
pub const MAX_NAMES: usize = 35;

/// Longest timeout accepted by lock entry points.
pub const MAX_TIME_NS: u64 = u32::MAX as u64 * 1_000_000;

/// A native buffer descriptor.
///
/// The engine reads `len_used` bytes from `buf_addr` for inputs. For outputs
/// it writes at most `len_alloc` bytes; when the result does not fit it stores
/// the required length in `len_used` and reports `INVSTRLEN` without copying.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Capacity of the storage at `buf_addr`.
    pub len_alloc: u32,
    /// Number of meaningful bytes (or the required length after `INVSTRLEN`).
    pub len_used: u32,
    /// Native storage; may be null when `len_alloc` is zero.
    pub buf_addr: *mut u8,
}

impl BufferDesc {
    /// A descriptor with no storage.
    pub const fn empty() -> Self {
        Self {
            len_alloc: 0,
            len_used: 0,
            buf_addr: std::ptr::null_mut(),
        }
    }

    /// Returns true if the descriptor references no storage.
    pub fn is_null(&self) -> bool {
        self.buf_addr.is_null()
    }

    /// Returns true if `len_used` exceeds `len_alloc`.
    pub fn is_stale(&self) -> bool {
        self.len_used > self.len_alloc
    }

    /// Views the descriptor as an input value.
    ///
    /// Returns the status the engine reports for malformed input descriptors:
    /// `INVSTRLEN` when `len_used > len_alloc` and `PARAMINVALID` for a null
    /// address with a non-zero length.
    ///
    /// # Safety
    ///
    /// `buf_addr` must be valid for `len_used` bytes for the returned lifetime.
    pub unsafe fn input(&self) -> Result<&[u8], i32> {
        if self.is_stale() {
            return Err(crate::status::INVSTRLEN);
        }
        if self.len_used == 0 {
            return Ok(&[]);
        }
        if self.buf_addr.is_null() {
            return Err(crate::status::PARAMINVALID);
        }
        Ok(std::slice::from_raw_parts(
            self.buf_addr,
            self.len_used as usize,
        ))
    }

    /// Writes an output value using the capacity-report convention.
    ///
    /// Returns `false` when `bytes` does not fit; `len_used` then holds the
    /// required length and the storage is left untouched.
    ///
    /// # Safety
    ///
    /// `buf_addr` must be valid for writes of `len_alloc` bytes.
    pub unsafe fn fill(&mut self, bytes: &[u8]) -> bool {
        let len = bytes.len() as u32;
        if len > self.len_alloc {
            self.len_used = len;
            return false;
        }
        if len > 0 {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf_addr, bytes.len());
        }
        self.len_used = len;
        true
    }
}

/// Which part of a tree `delete` removes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    /// Only the value at the node; descendants survive.
    Node = 1,
    /// The node and its whole subtree.
    Tree = 2,
}

/// Variadic entry points reachable through [`ParamBlock`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariadicEntry {
    /// Release all locks held, then acquire every listed lock.
    ///
    /// Layout: `timeout_ns` (one slot, or two on 32-bit targets), `namecount`,
    /// then per name: `*const BufferDesc` varname, subscript count,
    /// `*const BufferDesc` subscript array.
    Lock = 1,
    /// Invoke a registered routine.
    ///
    /// Layout: `*const BufferDesc` routine name, `*mut BufferDesc` return
    /// buffer, then one `*const BufferDesc` per argument.
    CallIn = 2,
}

/// Explicit positional argument block for variadic entry points.
///
/// Every address placed in `args` must reference natively-owned memory that
/// outlives the call.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct ParamBlock {
    /// Number of slots in use.
    pub n: isize,
    /// Positional slots.
    pub args: [usize; MAX_PARAMS],
}

impl ParamBlock {
    /// Creates an empty block.
    pub const fn new() -> Self {
        Self {
            n: 0,
            args: [0; MAX_PARAMS],
        }
    }

    /// Returns the slots in use, clamped to the block size.
    pub fn used(&self) -> &[usize] {
        let n = self.n.clamp(0, MAX_PARAMS as isize) as usize;
        &self.args[..n]
    }
}

impl Default for ParamBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction callback signature invoked by the engine's `tp` entry point.
pub type TpFn = unsafe extern "C" fn(tptoken: u64, errstr: *mut BufferDesc, param: *mut c_void) -> i32;
