//! Single-slot frame admission
//!
//! At most one conversion + inference job is in flight. Frames that arrive
//! while the slot is taken are dropped, never queued, so the worker always
//! picks up recent data and memory stays bounded.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters describing what the gate did with delivered frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub arrivals: u64,
    pub admitted: u64,
    pub dropped_busy: u64,
    pub skipped_divisor: u64,
    pub released: u64,
}

/// Outcome of offering one frame to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// A previous frame is still being processed
    Busy,
    /// Filtered by the admission-rate divisor
    Skipped,
}

pub struct AdmissionGate {
    busy: AtomicBool,
    divisor: u64,
    arrivals: AtomicU64,
    admitted: AtomicU64,
    dropped_busy: AtomicU64,
    skipped_divisor: AtomicU64,
    released: AtomicU64,
}

impl AdmissionGate {
    /// Gate that considers every delivered frame
    pub fn new() -> Self {
        Self::with_divisor(1)
    }

    /// Gate that only considers every `divisor`th delivered frame
    pub fn with_divisor(divisor: u32) -> Self {
        Self {
            busy: AtomicBool::new(false),
            divisor: divisor.max(1) as u64,
            arrivals: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            dropped_busy: AtomicU64::new(0),
            skipped_divisor: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Offer one delivered frame. Never blocks.
    pub fn offer(&self) -> Admission {
        let arrival = self.arrivals.fetch_add(1, Ordering::Relaxed);
        if arrival % self.divisor != 0 {
            self.skipped_divisor.fetch_add(1, Ordering::Relaxed);
            return Admission::Skipped;
        }

        if self.try_admit() {
            Admission::Admitted
        } else {
            Admission::Busy
        }
    }

    /// Mark the slot busy if it was free. Returns false, leaving the slot
    /// untouched, when a job is already in flight.
    pub fn try_admit(&self) -> bool {
        match self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped_busy.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Clear the busy flag unconditionally
    pub fn release(&self) {
        if !self.busy.swap(false, Ordering::AcqRel) {
            warn!("Admission gate released while idle");
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Admit and wrap the slot in a permit that releases on drop
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        if self.try_admit() {
            Some(SlotPermit { gate: Arc::clone(self) })
        } else {
            None
        }
    }

    /// Like `offer`, but hands back a permit for admitted frames
    pub fn offer_permit(self: &Arc<Self>) -> (Admission, Option<SlotPermit>) {
        match self.offer() {
            Admission::Admitted => (
                Admission::Admitted,
                Some(SlotPermit { gate: Arc::clone(self) }),
            ),
            other => (other, None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn divisor(&self) -> u32 {
        self.divisor as u32
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            arrivals: self.arrivals.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            skipped_divisor: self.skipped_divisor.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of the single in-flight slot.
///
/// Dropping the permit releases the gate, so every exit path of the worker
/// (success, error or panic unwind) frees the slot exactly once.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct SlotPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        debug!("Releasing pipeline slot");
        self.gate.release();
    }
}
