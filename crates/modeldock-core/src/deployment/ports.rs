//! Port allocation for deployment bindings.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;

use crate::error::{OrchestratorError, Result};

/// Hands out ports from a fixed range. A port is free when no other
/// deployment holds it and a listener can bind it right now.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    held: Mutex<HashSet<u16>>,
}

fn bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: end.max(start),
            held: Mutex::new(HashSet::new()),
        }
    }

    /// The preferred port when it is free, else the first free port in range.
    pub fn allocate(&self, host: &str, preferred: Option<u16>) -> Result<u16> {
        let mut held = self.held.lock();
        if let Some(port) = preferred {
            if !held.contains(&port) && bindable(host, port) {
                held.insert(port);
                return Ok(port);
            }
            tracing::debug!(host, port, "preferred port unavailable, scanning range");
        }
        for port in self.start..=self.end {
            if !held.contains(&port) && bindable(host, port) {
                held.insert(port);
                return Ok(port);
            }
        }
        Err(OrchestratorError::Binding(format!(
            "no free port on {} in {}-{}",
            host, self.start, self.end
        )))
    }

    pub fn release(&self, port: u16) {
        self.held.lock().remove(&port);
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}
