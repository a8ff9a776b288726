//! Node link abstraction
//!
//! A [`Link`] is a point-to-point, newline-framed channel to one node. Reads
//! never block: the cycle takes whatever frames are already buffered and moves
//! on. Writes are bounded; a write that cannot complete in its budget fails
//! with [`LinkError::Timeout`] and feeds liveness tracking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::LinkError;

/// Framed message channel to one node
pub trait Link: Send {
    /// Human readable name used in logs
    fn name(&self) -> &str;

    /// Take the next complete inbound frame, if one is buffered
    fn try_recv_line(&mut self) -> Result<Option<String>, LinkError>;

    /// Queue one outbound frame (the newline is added by the link)
    fn send_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Discard every buffered inbound frame, returning how many were dropped
    fn drain(&mut self) -> Result<usize, LinkError> {
        let mut dropped = 0;
        while self.try_recv_line()?.is_some() {
            dropped += 1;
        }
        Ok(dropped)
    }
}

type Queue = Arc<Mutex<VecDeque<String>>>;

/// Queue-backed link end, created in connected pairs
///
/// Used by the demo bench and by tests standing in for a node.
#[derive(Clone)]
pub struct MemoryLink {
    name: String,
    inbound: Queue,
    outbound: Queue,
    stalled: Arc<AtomicBool>,
    capacity: usize,
}

impl MemoryLink {
    /// Default per-direction queue depth
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create two connected ends; what one sends the other receives
    pub fn pair(a: &str, b: &str) -> (MemoryLink, MemoryLink) {
        let a_to_b: Queue = Arc::default();
        let b_to_a: Queue = Arc::default();
        let stalled = Arc::new(AtomicBool::new(false));

        let left = MemoryLink {
            name: a.to_string(),
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            stalled: stalled.clone(),
            capacity: Self::DEFAULT_CAPACITY,
        };
        let right = MemoryLink {
            name: b.to_string(),
            inbound: a_to_b,
            outbound: b_to_a,
            stalled,
            capacity: Self::DEFAULT_CAPACITY,
        };
        (left, right)
    }

    /// Simulate a hung node: writes time out and nothing is delivered
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Number of frames waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Link for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv_line(&mut self) -> Result<Option<String>, LinkError> {
        if self.is_stalled() {
            return Ok(None);
        }
        let mut queue = self.inbound.lock().map_err(|_| LinkError::Disconnected)?;
        Ok(queue.pop_front())
    }

    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        if self.is_stalled() {
            return Err(LinkError::Timeout);
        }
        let mut queue = self.outbound.lock().map_err(|_| LinkError::Disconnected)?;
        if queue.len() >= self.capacity {
            return Err(LinkError::Backpressure);
        }
        queue.push_back(line.trim_end().to_string());
        Ok(())
    }
}
