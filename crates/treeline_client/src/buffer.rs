//! Owned and borrowed handles to native byte buffers.

use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryableCall;
use std::fmt;
use std::io::{self, Write};
use std::ptr::{self, NonNull};
use treeline_engine::{BufferDesc, MAX_STR};

/// Reads the meaningful bytes of a descriptor.
///
/// A stale descriptor (`len_used > len_alloc`) fails with
/// [`ClientError::StaleLength`] carrying the bytes that fit.
pub(crate) fn read_desc(desc: &BufferDesc) -> ClientResult<Vec<u8>> {
    let bytes = view_desc(desc).to_vec();
    if desc.is_stale() {
        return Err(ClientError::StaleLength {
            partial: bytes,
            used: desc.len_used,
            capacity: desc.len_alloc,
        });
    }
    Ok(bytes)
}

/// Views the bytes of a descriptor that fit its capacity.
pub(crate) fn view_desc(desc: &BufferDesc) -> &[u8] {
    let fitted = desc.len_used.min(desc.len_alloc) as usize;
    if fitted == 0 || desc.buf_addr.is_null() {
        return &[];
    }
    // SAFETY: descriptors held by this crate reference `len_alloc` valid bytes.
    unsafe { std::slice::from_raw_parts(desc.buf_addr, fitted) }
}

/// Writes `bytes` into a descriptor, or records the required length and fails.
pub(crate) fn write_desc(desc: &mut BufferDesc, bytes: &[u8]) -> ClientResult<()> {
    let required = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    if required > desc.len_alloc {
        desc.len_used = required;
        return Err(ClientError::CapacityExceeded {
            required,
            capacity: desc.len_alloc,
        });
    }
    if required > 0 {
        // SAFETY: `buf_addr` has `len_alloc >= required` writable bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), desc.buf_addr, bytes.len()) };
    }
    desc.len_used = required;
    Ok(())
}

pub(crate) fn check_size(size: u32) -> ClientResult<()> {
    if size > MAX_STR {
        return Err(ClientError::CapacityExceeded {
            required: size,
            capacity: MAX_STR,
        });
    }
    Ok(())
}

enum Handle {
    Unallocated,
    Owned(BufferDesc),
    Borrowed(NonNull<BufferDesc>),
}

/// A native byte buffer: storage, capacity and used length.
///
/// An owning buffer frees its storage on [`release`](Self::release) or drop.
/// A borrowed buffer aliases a descriptor owned elsewhere and never frees it.
/// Cloning always produces a fresh owning buffer.
///
/// # Example
///
/// ```
/// use treeline_client::NativeBuffer;
///
/// let mut buf = NativeBuffer::with_capacity(5)?;
/// buf.set_value(b"hello")?;
/// assert_eq!(buf.value()?, b"hello");
///
/// buf.allocate(3)?;
/// assert!(buf.value()?.is_empty());
/// # Ok::<(), treeline_client::ClientError>(())
/// ```
pub struct NativeBuffer {
    handle: Handle,
}

// SAFETY: owned storage is exclusively held; borrowed handles are only
// created inside a transaction callback's connection, which is not Sync.
unsafe impl Send for NativeBuffer {}

impl NativeBuffer {
    /// Creates an unallocated buffer.
    pub const fn new() -> Self {
        Self {
            handle: Handle::Unallocated,
        }
    }

    /// Creates a buffer with `size` bytes of zeroed storage.
    pub fn with_capacity(size: u32) -> ClientResult<Self> {
        let mut buf = Self::new();
        buf.allocate(size)?;
        Ok(buf)
    }

    /// Creates a buffer sized to and holding `bytes`.
    pub fn from_value(bytes: &[u8]) -> ClientResult<Self> {
        let size = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        let mut buf = Self::with_capacity(size)?;
        buf.set_value(bytes)?;
        Ok(buf)
    }

    /// Aliases a descriptor owned elsewhere.
    ///
    /// # Safety
    ///
    /// `desc` must stay valid, and its storage must not be freed, for as long
    /// as the returned buffer is used.
    pub(crate) unsafe fn borrowed(desc: NonNull<BufferDesc>) -> Self {
        Self {
            handle: Handle::Borrowed(desc),
        }
    }

    /// Replaces any storage with `size` zeroed bytes; used length resets to zero.
    ///
    /// A size of zero yields a buffer with null storage and capacity zero.
    pub fn allocate(&mut self, size: u32) -> ClientResult<()> {
        check_size(size)?;
        self.reset(size);
        Ok(())
    }

    /// Creates an owning buffer of `size` bytes, capped at the engine maximum.
    pub(crate) fn sized(size: u32) -> Self {
        let mut buf = Self::new();
        buf.reset(size.min(MAX_STR));
        buf
    }

    fn reset(&mut self, size: u32) {
        self.release();
        let buf_addr = if size == 0 {
            ptr::null_mut()
        } else {
            Box::into_raw(vec![0u8; size as usize].into_boxed_slice()).cast::<u8>()
        };
        self.handle = Handle::Owned(BufferDesc {
            len_alloc: size,
            len_used: 0,
            buf_addr,
        });
    }

    /// Frees owned storage. Releasing twice, or releasing a borrowed buffer, is a no-op.
    pub fn release(&mut self) {
        if let Handle::Owned(desc) = std::mem::replace(&mut self.handle, Handle::Unallocated) {
            if !desc.buf_addr.is_null() {
                let storage = ptr::slice_from_raw_parts_mut(desc.buf_addr, desc.len_alloc as usize);
                // SAFETY: allocated in `allocate` as a boxed slice of `len_alloc` bytes.
                drop(unsafe { Box::from_raw(storage) });
            }
        }
    }

    /// Returns true while the buffer holds or aliases storage.
    pub fn is_allocated(&self) -> bool {
        !matches!(self.handle, Handle::Unallocated)
    }

    /// Returns true if this buffer frees its storage.
    pub fn owns_storage(&self) -> bool {
        matches!(self.handle, Handle::Owned(_))
    }

    pub(crate) fn desc(&self) -> ClientResult<&BufferDesc> {
        match &self.handle {
            Handle::Unallocated => Err(ClientError::NotAllocated),
            Handle::Owned(desc) => Ok(desc),
            // SAFETY: the aliased descriptor outlives this buffer.
            Handle::Borrowed(desc) => Ok(unsafe { desc.as_ref() }),
        }
    }

    pub(crate) fn desc_mut(&mut self) -> ClientResult<&mut BufferDesc> {
        match &mut self.handle {
            Handle::Unallocated => Err(ClientError::NotAllocated),
            Handle::Owned(desc) => Ok(desc),
            // SAFETY: as in `desc`.
            Handle::Borrowed(desc) => Ok(unsafe { desc.as_mut() }),
        }
    }

    /// Stores `bytes`.
    ///
    /// When `bytes` exceeds the capacity, nothing is copied, the used length is
    /// set to `bytes.len()` and [`ClientError::CapacityExceeded`] is returned.
    pub fn set_value(&mut self, bytes: &[u8]) -> ClientResult<()> {
        write_desc(self.desc_mut()?, bytes)
    }

    /// Returns the used bytes.
    pub fn value(&self) -> ClientResult<Vec<u8>> {
        read_desc(self.desc()?)
    }

    /// Returns the value as UTF-8, replacing invalid sequences.
    pub fn value_lossy(&self) -> ClientResult<String> {
        Ok(String::from_utf8_lossy(&self.value()?).into_owned())
    }

    /// Returns the capacity.
    pub fn len_alloc(&self) -> ClientResult<u32> {
        Ok(self.desc()?.len_alloc)
    }

    /// Returns the used length, which may exceed the capacity after a failed store.
    pub fn len_used(&self) -> ClientResult<u32> {
        Ok(self.desc()?.len_used)
    }

    /// Sets the used length; it cannot exceed the capacity.
    pub fn set_len_used(&mut self, len: u32) -> ClientResult<()> {
        let desc = self.desc_mut()?;
        if len > desc.len_alloc {
            return Err(ClientError::CapacityExceeded {
                required: len,
                capacity: desc.len_alloc,
            });
        }
        desc.len_used = len;
        Ok(())
    }

    /// Writes a human-readable description of the buffer.
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        match self.desc() {
            Err(_) => writeln!(w, "NativeBuffer(unallocated)"),
            Ok(desc) => {
                let shown = match read_desc(desc) {
                    Ok(bytes) | Err(ClientError::StaleLength { partial: bytes, .. }) => bytes,
                    Err(_) => Vec::new(),
                };
                writeln!(
                    w,
                    "NativeBuffer(len_alloc: {}, len_used: {}, owned: {}): {:?}",
                    desc.len_alloc,
                    desc.len_used,
                    self.owns_storage(),
                    String::from_utf8_lossy(&shown)
                )
            }
        }
    }

    /// Encodes this buffer's value in ZWRITE format into `out`, growing `out` as needed.
    pub fn str2zwr(&self, conn: &Conn, out: &mut NativeBuffer) -> ClientResult<()> {
        let input = self.desc()?;
        let status = RetryableCall::new(conn, "str2zwr")
            .run_value(out, |engine, tptoken, errstr, ret| engine.str2zwr(tptoken, errstr, input, ret))?;
        conn.check(status)
    }

    /// Decodes this buffer's ZWRITE-format value into `out`, growing `out` as needed.
    pub fn zwr2str(&self, conn: &Conn, out: &mut NativeBuffer) -> ClientResult<()> {
        let input = self.desc()?;
        let status = RetryableCall::new(conn, "zwr2str")
            .run_value(out, |engine, tptoken, errstr, ret| engine.zwr2str(tptoken, errstr, input, ret))?;
        conn.check(status)
    }
}

impl Default for NativeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for NativeBuffer {
    fn clone(&self) -> Self {
        let Ok(desc) = self.desc() else {
            return Self::new();
        };
        let mut copy = BufferDesc {
            len_alloc: desc.len_alloc,
            len_used: desc.len_used,
            buf_addr: ptr::null_mut(),
        };
        if desc.len_alloc > 0 {
            let mut storage = vec![0u8; desc.len_alloc as usize].into_boxed_slice();
            let fitted = desc.len_used.min(desc.len_alloc) as usize;
            if fitted > 0 {
                // SAFETY: the source holds `len_alloc >= fitted` valid bytes.
                storage[..fitted].copy_from_slice(unsafe { std::slice::from_raw_parts(desc.buf_addr, fitted) });
            }
            copy.buf_addr = Box::into_raw(storage).cast::<u8>();
        }
        Self {
            handle: Handle::Owned(copy),
        }
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.desc() {
            Ok(desc) => f
                .debug_struct("NativeBuffer")
                .field("len_alloc", &desc.len_alloc)
                .field("len_used", &desc.len_used)
                .field("owned", &self.owns_storage())
                .finish(),
            Err(_) => f.write_str("NativeBuffer(unallocated)"),
        }
    }
}
