//! Tunnel slot allocator
//!
//! Slots are small integers naming tunnel interfaces (`vpn_tun0`,
//! `vpn_tun1`, ...). Freed slots are handed out again, oldest first, before
//! a new number is minted, which keeps interface names short and stable.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use parking_lot::Mutex;

/// Errors returned by the slot allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The slot was released without being active
    NotActive(u32),
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::NotActive(slot) => write!(f, "slot {} is not active", slot),
        }
    }
}

impl std::error::Error for SlotError {}

struct SlotState {
    next: u32,
    free: VecDeque<u32>,
    active: BTreeSet<u32>,
}

/// Thread-safe allocator of tunnel slot numbers
pub struct SlotAllocator {
    state: Mutex<SlotState>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        SlotAllocator {
            state: Mutex::new(SlotState {
                next: 0,
                free: VecDeque::new(),
                active: BTreeSet::new(),
            }),
        }
    }

    /// Take the oldest freed slot, or mint the next one
    pub fn acquire(&self) -> u32 {
        let mut state = self.state.lock();
        let slot = match state.free.pop_front() {
            Some(slot) => slot,
            None => {
                let slot = state.next;
                state.next += 1;
                slot
            }
        };
        state.active.insert(slot);
        slot
    }

    /// Give a slot back
    pub fn release(&self, slot: u32) -> Result<(), SlotError> {
        let mut state = self.state.lock();
        if !state.active.remove(&slot) {
            log::warn!("Attempted to release inactive slot {}", slot);
            return Err(SlotError::NotActive(slot));
        }
        state.free.push_back(slot);
        Ok(())
    }

    /// Sorted snapshot of the slots currently in use
    pub fn active_slots(&self) -> Vec<u32> {
        self.state.lock().active.iter().copied().collect()
    }

    /// Highest slot number minted so far plus one
    pub fn minted(&self) -> u32 {
        self.state.lock().next
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}
