//! RTP/RTCP port pair allocator
//!
//! Hands out an even RTP port with the adjacent odd RTCP port from a
//! configured range. The pool is a plain set of free even ports behind one
//! mutex; there is no fairness or ordering guarantee.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::config::PortRange;
use crate::{Error, Result};

#[derive(Debug)]
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
    range: PortRange,
}

/// One allocated pair: `rtp` is even, `rtcp == rtp + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        let min = range.min + (range.min & 1); // round up to even
        let free: BTreeSet<u16> = (min..range.max)
            .step_by(2)
            .filter(|p| p + 1 < range.max)
            .collect();
        Self {
            free: Mutex::new(free),
            range,
        }
    }

    pub fn allocate(&self) -> Result<PortPair> {
        let mut free = self.free.lock().unwrap();
        let rtp = free
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::media("RTP port range exhausted"))?;
        free.remove(&rtp);
        Ok(PortPair { rtp, rtcp: rtp + 1 })
    }

    /// Return a pair to the pool. Unknown or out-of-range ports are ignored.
    pub fn release(&self, rtp_port: u16) {
        if rtp_port & 1 != 0 || rtp_port < self.range.min || rtp_port >= self.range.max {
            return;
        }
        self.free.lock().unwrap().insert(rtp_port);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
