//! 🚦 The READY/BUSY admission gate. Two states, one atomic, zero queueing.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GateState {
    Ready = 0,
    Busy = 1,
}

impl GateState {
    fn from_u8(raw: u8) -> Self {
        if raw == GateState::Busy as u8 {
            GateState::Busy
        } else {
            GateState::Ready
        }
    }
}

#[derive(Debug)]
pub struct ServerGate {
    state: AtomicU8,
}

impl Default for ServerGate {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(GateState::Ready as u8),
        }
    }
}

impl ServerGate {
    /// 🎟️ READY → BUSY, atomically. `None` means somebody else got here first.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.state
            .compare_exchange(
                GateState::Ready as u8,
                GateState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    pub fn state(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// 🔓 Back to READY when this drops: normal finish, error, panic, or a client that just left.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a ServerGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.state.store(GateState::Ready as u8, Ordering::Release);
    }
}
