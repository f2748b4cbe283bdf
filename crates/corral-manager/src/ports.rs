use corral_core::{CorralError, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug)]
struct PortState {
    cursor: u16,
    in_use: BTreeSet<u16>,
}

/// Hands out host ports from an inclusive range, round-robin.
///
/// A port is never handed out twice until it is released.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            start,
            end,
            state: Mutex::new(PortState {
                cursor: start,
                in_use: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Allocate `count` ports, all or nothing.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut state = self.lock();
        if state.in_use.len() + count > self.capacity() {
            return Err(CorralError::PortsExhausted {
                start: self.start,
                end: self.end,
            });
        }

        let mut ports = Vec::with_capacity(count);
        while ports.len() < count {
            let candidate = state.cursor;
            state.cursor = if candidate >= self.end {
                self.start
            } else {
                candidate + 1
            };
            if state.in_use.insert(candidate) {
                ports.push(candidate);
            }
        }
        Ok(ports)
    }

    /// Mark ports as taken, e.g. for records registered from outside.
    /// Ports outside the range are ignored.
    pub fn reserve(&self, ports: &[u16]) {
        let mut state = self.lock();
        for port in ports {
            if (self.start..=self.end).contains(port) {
                state.in_use.insert(*port);
            }
        }
    }

    pub fn release(&self, ports: &[u16]) {
        let mut state = self.lock();
        for port in ports {
            state.in_use.remove(port);
        }
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }
}
