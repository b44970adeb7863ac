//! Arrays of native buffers sharing one allocation.

use crate::block::DescBlock;
use crate::buffer::{check_size, read_desc, write_desc};
use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use crate::transaction::{self, TxnOutcome};
use std::fmt;
use std::io::{self, Write};
use treeline_engine::BufferDesc;

/// A fixed number of equally-sized native buffers allocated as one block,
/// with a used count marking how many are meaningful.
///
/// Serves as a key's subscript list, as the result of depth-first node
/// steps, and as the variable list for transactions and exclusive deletes.
#[derive(Clone, Default)]
pub struct BufferSet {
    block: Option<DescBlock>,
    elem_size: u32,
    used: u32,
}

impl BufferSet {
    /// Creates an unallocated set.
    pub const fn new() -> Self {
        Self {
            block: None,
            elem_size: 0,
            used: 0,
        }
    }

    /// Creates a set of `count` elements of `elem_size` bytes each.
    pub fn with_capacity(count: u32, elem_size: u32) -> ClientResult<Self> {
        let mut set = Self::new();
        set.allocate(count, elem_size)?;
        Ok(set)
    }

    /// Creates a set holding `values`, every element sized to the longest one.
    pub fn from_values<S: AsRef<[u8]>>(values: &[S]) -> ClientResult<Self> {
        let elem_size = values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let elem_size = u32::try_from(elem_size).unwrap_or(u32::MAX);
        let count = u32::try_from(values.len()).unwrap_or(u32::MAX);
        let mut set = Self::with_capacity(count, elem_size)?;
        for (i, value) in values.iter().enumerate() {
            set.set_element_value(i, value.as_ref())?;
        }
        set.used = count;
        Ok(set)
    }

    /// Replaces any block with `count` zeroed elements; the used count resets to zero.
    pub fn allocate(&mut self, count: u32, elem_size: u32) -> ClientResult<()> {
        check_size(elem_size)?;
        let sizes = vec![elem_size; count as usize];
        self.block = Some(DescBlock::new(&sizes)?);
        self.elem_size = elem_size;
        self.used = 0;
        Ok(())
    }

    /// Frees the block. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.block = None;
        self.elem_size = 0;
        self.used = 0;
    }

    /// Returns true while the set holds a block.
    pub fn is_allocated(&self) -> bool {
        self.block.is_some()
    }

    fn block(&self) -> ClientResult<&DescBlock> {
        self.block.as_ref().ok_or(ClientError::NotAllocated)
    }

    fn block_mut(&mut self) -> ClientResult<&mut DescBlock> {
        self.block.as_mut().ok_or(ClientError::NotAllocated)
    }

    /// Number of allocated elements.
    pub fn len_alloc(&self) -> ClientResult<u32> {
        Ok(self.block()?.len() as u32)
    }

    /// Number of meaningful elements.
    pub fn len_used(&self) -> ClientResult<u32> {
        self.block()?;
        Ok(self.used)
    }

    /// Per-element capacity chosen at allocation.
    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    /// Sets the number of meaningful elements.
    pub fn set_used_count(&mut self, count: u32) -> ClientResult<()> {
        let len = self.block()?.len();
        if count as usize > len {
            return Err(ClientError::IndexOutOfRange {
                index: count as usize,
                len,
            });
        }
        self.used = count;
        Ok(())
    }

    fn elem(&self, index: usize) -> ClientResult<&BufferDesc> {
        let descs = self.block()?.descs();
        descs
            .get(index)
            .ok_or(ClientError::IndexOutOfRange { index, len: descs.len() })
    }

    fn elem_mut(&mut self, index: usize) -> ClientResult<&mut BufferDesc> {
        let descs = self.block_mut()?.descs_mut();
        let len = descs.len();
        descs.get_mut(index).ok_or(ClientError::IndexOutOfRange { index, len })
    }

    /// Returns element `index`'s used bytes.
    pub fn element_value(&self, index: usize) -> ClientResult<Vec<u8>> {
        read_desc(self.elem(index)?)
    }

    /// Stores `bytes` in element `index`, with [`crate::NativeBuffer::set_value`] semantics.
    pub fn set_element_value(&mut self, index: usize, bytes: &[u8]) -> ClientResult<()> {
        write_desc(self.elem_mut(index)?, bytes)
    }

    /// Capacity of element `index`.
    pub fn elem_len_alloc(&self, index: usize) -> ClientResult<u32> {
        Ok(self.elem(index)?.len_alloc)
    }

    /// Used length of element `index`.
    pub fn elem_len_used(&self, index: usize) -> ClientResult<u32> {
        Ok(self.elem(index)?.len_used)
    }

    /// Sets the used length of element `index`; it cannot exceed the element's capacity.
    pub fn set_elem_len_used(&mut self, index: usize, len: u32) -> ClientResult<()> {
        let desc = self.elem_mut(index)?;
        if len > desc.len_alloc {
            return Err(ClientError::CapacityExceeded {
                required: len,
                capacity: desc.len_alloc,
            });
        }
        desc.len_used = len;
        Ok(())
    }

    /// Returns the used elements' values.
    pub fn values(&self) -> ClientResult<Vec<Vec<u8>>> {
        self.descs()?.iter().map(read_desc).collect()
    }

    /// Descriptors of the used elements. An unallocated set is an empty list.
    pub(crate) fn descs(&self) -> ClientResult<&[BufferDesc]> {
        match &self.block {
            None => Ok(&[]),
            Some(block) => Ok(&block.descs()[..self.used as usize]),
        }
    }

    /// Descriptors of every allocated element.
    pub(crate) fn descs_mut_all(&mut self) -> ClientResult<&mut [BufferDesc]> {
        Ok(self.block_mut()?.descs_mut())
    }

    /// Reallocates to `count` elements, keeping the element size.
    pub(crate) fn grow_count(&mut self, count: u32) -> ClientResult<()> {
        self.allocate(count, self.elem_size)
    }

    /// Reallocates every element to `elem_size` bytes, keeping the count.
    pub(crate) fn grow_elements(&mut self, elem_size: u32) -> ClientResult<()> {
        let count = self.len_alloc()?;
        self.allocate(count, elem_size)
    }

    /// Deletes every local variable except those named in the used elements.
    pub fn delete_excl(&self, conn: &Conn) -> ClientResult<()> {
        let names = self.descs()?;
        let status = conn.invoke(|engine, tptoken, errstr| engine.delete_excl(tptoken, errstr, names));
        conn.check(status)
    }

    /// Runs `f` in a transaction, restoring the locals named in the used elements on restart.
    ///
    /// Returns `false` if the transaction rolled back.
    pub fn tp<F>(&self, conn: &Conn, transid: &str, f: F) -> ClientResult<bool>
    where
        F: FnMut(&Conn) -> ClientResult<TxnOutcome>,
    {
        transaction::run(conn, transid, self.descs()?, f)
    }

    /// Writes a human-readable description of the used elements.
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        let Some(block) = &self.block else {
            return writeln!(w, "BufferSet(unallocated)");
        };
        writeln!(
            w,
            "BufferSet(len_alloc: {}, len_used: {}, elem_size: {})",
            block.len(),
            self.used,
            self.elem_size
        )?;
        for (i, desc) in block.descs()[..self.used as usize].iter().enumerate() {
            let shown = match read_desc(desc) {
                Ok(bytes) | Err(ClientError::StaleLength { partial: bytes, .. }) => bytes,
                Err(_) => Vec::new(),
            };
            writeln!(
                w,
                "  [{i}] len_alloc: {}, len_used: {}: {:?}",
                desc.len_alloc,
                desc.len_used,
                String::from_utf8_lossy(&shown)
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSet")
            .field("len_alloc", &self.block.as_ref().map_or(0, DescBlock::len))
            .field("len_used", &self.used)
            .field("elem_size", &self.elem_size)
            .finish()
    }
}
