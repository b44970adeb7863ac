//! Variadic engine calls through an explicit parameter block.
//!
//! Entry points that take a variable argument list are driven by filling the
//! connection's [`ParamBlock`] with positional values and handing it to the
//! engine's fixed-arity `call_variadic`. Descriptor addresses pushed into the
//! block are borrowed for `'d`, so they outlive the call by construction.

use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use std::cell::RefMut;
use std::marker::PhantomData;
use treeline_engine::{BufferDesc, ParamBlock, VariadicEntry, MAX_PARAMS};

pub(crate) struct VariadicCall<'c, 'd> {
    conn: &'c Conn,
    block: RefMut<'c, ParamBlock>,
    _descs: PhantomData<&'d mut BufferDesc>,
}

impl<'c, 'd> VariadicCall<'c, 'd> {
    /// Starts a call that will use `slots` parameter slots.
    ///
    /// Fails before anything is pushed if `slots` exceeds the block.
    pub fn new(conn: &'c Conn, slots: usize) -> ClientResult<Self> {
        if slots > MAX_PARAMS {
            return Err(ClientError::ArgumentOverflow {
                count: slots,
                max: MAX_PARAMS,
            });
        }
        let mut block = conn.params();
        block.n = 0;
        Ok(Self {
            conn,
            block,
            _descs: PhantomData,
        })
    }

    pub fn push_usize(&mut self, value: usize) -> ClientResult<()> {
        let n = self.block.n as usize;
        if n >= MAX_PARAMS {
            return Err(ClientError::ArgumentOverflow {
                count: n + 1,
                max: MAX_PARAMS,
            });
        }
        self.block.args[n] = value;
        self.block.n += 1;
        Ok(())
    }

    /// Pushes a 64-bit value: one slot on 64-bit targets, two in memory order otherwise.
    #[cfg(target_pointer_width = "64")]
    pub fn push_u64(&mut self, value: u64) -> ClientResult<()> {
        self.push_usize(value as usize)
    }

    #[cfg(not(target_pointer_width = "64"))]
    pub fn push_u64(&mut self, value: u64) -> ClientResult<()> {
        let (low, high) = (value as usize, (value >> 32) as usize);
        if cfg!(target_endian = "little") {
            self.push_usize(low)?;
            self.push_usize(high)
        } else {
            self.push_usize(high)?;
            self.push_usize(low)
        }
    }

    pub fn push_desc(&mut self, desc: &'d BufferDesc) -> ClientResult<()> {
        self.push_usize(std::ptr::from_ref(desc) as usize)
    }

    pub fn push_desc_mut(&mut self, desc: &'d mut BufferDesc) -> ClientResult<()> {
        self.push_usize(std::ptr::from_mut(desc) as usize)
    }

    /// Pushes the address of a descriptor array.
    pub fn push_descs(&mut self, descs: &'d [BufferDesc]) -> ClientResult<()> {
        self.push_usize(descs.as_ptr() as usize)
    }

    /// Invokes `entry` with the pushed arguments and returns its status.
    pub fn invoke(self, entry: VariadicEntry) -> i32 {
        let block = &*self.block;
        self.conn.invoke(|engine, tptoken, errstr| {
            // SAFETY: every address in the block is a descriptor borrowed for 'd.
            unsafe { engine.call_variadic(tptoken, errstr, entry, block) }
        })
    }
}
