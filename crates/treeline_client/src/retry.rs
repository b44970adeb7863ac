//! The capacity-retry protocol.
//!
//! Calls that return engine-sized data are invoked with the caller's current
//! buffers. When the engine reports `INVSTRLEN` it has stored the required
//! length in the output descriptor; `INSUFFSUBS` means it stored the required
//! element count. The implicated buffer is reallocated to exactly that size and
//! the call is repeated. Any other status ends the loop and is returned.
//!
//! Growth must be strict and bounded by the engine's limits, otherwise the
//! engine is not honouring the protocol and the call fails with
//! [`ClientError::ProtocolViolation`]. Calls with side effects (`incr`,
//! call-ins) never go through here.

use crate::buffer::NativeBuffer;
use crate::buffer_set::BufferSet;
use crate::conn::Conn;
use crate::error::{ClientError, ClientResult};
use tracing::{debug, warn};
use treeline_engine::status::{INSUFFSUBS, INVSTRLEN, OK};
use treeline_engine::{BufferDesc, Engine, MAX_STR, MAX_SUBSCRIPTS};

pub(crate) struct RetryableCall<'a> {
    conn: &'a Conn,
    entry: &'static str,
    attempts: u32,
}

impl<'a> RetryableCall<'a> {
    pub fn new(conn: &'a Conn, entry: &'static str) -> Self {
        Self {
            conn,
            entry,
            attempts: 0,
        }
    }

    /// Accounts for one growth step, failing if it would not converge.
    pub fn grow(&mut self, what: &str, required: u32, current: u32, limit: u32) -> ClientResult<()> {
        self.attempts += 1;
        if required <= current || required > limit || self.attempts > self.conn.config().max_retries {
            warn!(
                entry = self.entry,
                what,
                required,
                current,
                attempts = self.attempts,
                "capacity retry did not converge"
            );
            return Err(ClientError::protocol_violation(format!(
                "{}: {what} of {required} requested with {current} allocated (limit {limit}, attempt {})",
                self.entry, self.attempts
            )));
        }
        debug!(entry = self.entry, what, required, current, "growing buffer for retry");
        Ok(())
    }

    /// Runs a call that writes one value into `ret`.
    ///
    /// Returns the first status other than a recoverable `INVSTRLEN`.
    pub fn run_value<F>(mut self, ret: &mut NativeBuffer, mut call: F) -> ClientResult<i32>
    where
        F: FnMut(&dyn Engine, u64, Option<&mut BufferDesc>, &mut BufferDesc) -> i32,
    {
        loop {
            let desc = ret.desc_mut()?;
            let capacity = desc.len_alloc;
            let status = self
                .conn
                .invoke(|engine, tptoken, errstr| call(engine, tptoken, errstr, &mut *desc));
            let required = desc.len_used;
            if status != INVSTRLEN || required <= capacity {
                return Ok(status);
            }
            self.grow("value", required, capacity, MAX_STR)?;
            ret.allocate(required)?;
        }
    }

    /// Runs a call that writes a subscript list into `ret`.
    ///
    /// On `OK` the set's used count is the number of subscripts returned.
    pub fn run_subs<F>(mut self, ret: &mut BufferSet, mut call: F) -> ClientResult<i32>
    where
        F: FnMut(&dyn Engine, u64, Option<&mut BufferDesc>, &mut u32, &mut [BufferDesc]) -> i32,
    {
        loop {
            let count = ret.len_alloc()?;
            let elem_size = ret.elem_size();
            let descs = ret.descs_mut_all()?;
            let mut used = count;
            let status = self
                .conn
                .invoke(|engine, tptoken, errstr| call(engine, tptoken, errstr, &mut used, &mut *descs));
            match status {
                OK => {
                    ret.set_used_count(used)?;
                    return Ok(OK);
                }
                INSUFFSUBS => {
                    self.grow("subscript count", used, count, MAX_SUBSCRIPTS as u32)?;
                    ret.grow_count(used)?;
                }
                INVSTRLEN => {
                    let Some(required) = descs.get(used as usize).map(|d| d.len_used) else {
                        return Ok(status);
                    };
                    if required <= elem_size {
                        return Ok(status);
                    }
                    self.grow("subscript size", required, elem_size, MAX_STR)?;
                    ret.grow_elements(required)?;
                }
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, ClientConfig};
    use std::cell::Cell;
    use std::sync::Arc;
    use treeline_engine::MemoryEngine;

    fn conn_with(config: ClientConfig) -> Conn {
        Client::init(Arc::new(MemoryEngine::new()), config).conn()
    }

    fn fill(desc: &mut BufferDesc, bytes: &[u8]) -> i32 {
        if unsafe { desc.fill(bytes) } {
            OK
        } else {
            INVSTRLEN
        }
    }

    #[test]
    fn value_grows_to_exact_requirement() {
        let conn = conn_with(ClientConfig::default());
        let mut ret = NativeBuffer::with_capacity(2).unwrap();
        let calls = Cell::new(0);
        let status = RetryableCall::new(&conn, "test")
            .run_value(&mut ret, |_, _, _, desc| {
                calls.set(calls.get() + 1);
                fill(desc, b"twelve bytes")
            })
            .unwrap();
        assert_eq!(status, OK);
        assert_eq!(calls.get(), 2);
        assert_eq!(ret.len_alloc().unwrap(), 12);
        assert_eq!(ret.value().unwrap(), b"twelve bytes");
    }

    #[test]
    fn non_growing_report_is_returned() {
        let conn = conn_with(ClientConfig::default());
        let mut ret = NativeBuffer::with_capacity(8).unwrap();
        let status = RetryableCall::new(&conn, "test")
            .run_value(&mut ret, |_, _, _, desc| {
                desc.len_used = 3;
                INVSTRLEN
            })
            .unwrap();
        assert_eq!(status, INVSTRLEN);
    }

    #[test]
    fn endless_growth_is_a_protocol_violation() {
        let conn = conn_with(ClientConfig::new().max_retries(3));
        let mut ret = NativeBuffer::with_capacity(1).unwrap();
        let err = RetryableCall::new(&conn, "test")
            .run_value(&mut ret, |_, _, _, desc| {
                desc.len_used = desc.len_alloc + 1;
                INVSTRLEN
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation { .. }));

        let mut ret = NativeBuffer::with_capacity(1).unwrap();
        let err = RetryableCall::new(&conn, "test")
            .run_value(&mut ret, |_, _, _, desc| {
                desc.len_used = MAX_STR + 1;
                INVSTRLEN
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation { .. }));
    }

    #[test]
    fn subs_grow_count_then_size() {
        let conn = conn_with(ClientConfig::default());
        let mut ret = BufferSet::with_capacity(1, 2).unwrap();
        let wanted: [&[u8]; 3] = [b"a", b"bb", b"a much longer subscript"];
        let status = RetryableCall::new(&conn, "test")
            .run_subs(&mut ret, |_, _, _, used, descs| {
                if (*used as usize) < wanted.len() {
                    *used = wanted.len() as u32;
                    return INSUFFSUBS;
                }
                for (i, (sub, desc)) in wanted.iter().zip(descs.iter_mut()).enumerate() {
                    if fill(desc, sub) != OK {
                        *used = i as u32;
                        return INVSTRLEN;
                    }
                }
                *used = wanted.len() as u32;
                OK
            })
            .unwrap();
        assert_eq!(status, OK);
        assert_eq!(ret.len_used().unwrap(), 3);
        assert_eq!(ret.elem_size(), 23);
        assert_eq!(ret.element_value(2).unwrap(), wanted[2]);
    }

    #[test]
    fn unallocated_output_is_rejected() {
        let conn = conn_with(ClientConfig::default());
        let mut ret = NativeBuffer::new();
        let result = RetryableCall::new(&conn, "test").run_value(&mut ret, |_, _, _, _| OK);
        assert!(matches!(result, Err(ClientError::NotAllocated)));
    }
}
