//! Interrupt & Exception Controller
//!
//! Per-vCPU queue of pending events with architectural priority ordering:
//! exceptions before NMIs before maskable interrupts, lower vector first
//! inside a class. At most one event is placed in the control block's
//! injection field per entry; a maskable interrupt that finds the guest's
//! interrupt flag clear is held back and an interrupt-window intercept is
//! armed instead, so delivery happens on the exit taken the instant the guest
//! re-enables interrupts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::backend::ControlBlock;

/// Architectural event class, in ascending priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Interrupt,
    Nmi,
    Exception,
}

/// A queued event awaiting injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub vector: u8,
    pub error_code: Option<u32>,
}

impl PendingEvent {
    pub fn interrupt(vector: u8) -> Self {
        Self { kind: EventKind::Interrupt, vector, error_code: None }
    }

    pub fn nmi() -> Self {
        // NMI is always vector 2.
        Self { kind: EventKind::Nmi, vector: 2, error_code: None }
    }

    pub fn exception(vector: u8, error_code: Option<u32>) -> Self {
        Self { kind: EventKind::Exception, vector, error_code }
    }
}

// Max-heap ordering: highest-priority event compares greatest. Class first,
// then lower vector wins within a class.
impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| other.vector.cmp(&self.vector))
    }
}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptStats {
    pub queued: u64,
    pub coalesced: u64,
    pub injected: u64,
    pub windows_requested: u64,
}

/// Per-vCPU event controller.
#[derive(Default)]
pub struct InterruptController {
    pending: Mutex<BinaryHeap<PendingEvent>>,
    stats: Mutex<InterruptStats>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. A duplicate of an already-pending event (same class
    /// and vector) is coalesced into it; returns false in that case.
    pub fn queue(&self, event: PendingEvent) -> bool {
        let mut pending = self.pending.lock();
        if pending.iter().any(|e| e.kind == event.kind && e.vector == event.vector) {
            self.stats.lock().coalesced += 1;
            return false;
        }
        pending.push(event);
        self.stats.lock().queued += 1;
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether anything could actually be injected right now. Maskable
    /// interrupts do not count while the guest's interrupt flag is clear.
    pub fn has_deliverable(&self, guest_if: bool) -> bool {
        let pending = self.pending.lock();
        pending.iter().any(|e| e.kind != EventKind::Interrupt || guest_if)
    }

    /// Move at most one event into the control block's injection field.
    ///
    /// Called on every entry while the vCPU is outside guest mode. If the
    /// injection field is already valid (a previous entry failed before
    /// consuming it) nothing is touched. Exceptions and NMIs inject
    /// unconditionally; a maskable interrupt injects only with the guest's
    /// interrupt flag set, otherwise it stays queued and the interrupt-window
    /// intercept is armed.
    pub fn prepare_injection(&self, cb: &mut ControlBlock) {
        if cb.has_pending_injection() {
            return;
        }
        let mut pending = self.pending.lock();
        let top = match pending.peek() {
            Some(top) => *top,
            None => return,
        };
        if top.kind == EventKind::Interrupt && !cb.guest_if() {
            cb.request_interrupt_window();
            self.stats.lock().windows_requested += 1;
            return;
        }
        pending.pop();
        drop(pending);
        cb.inject_event(top.kind, top.vector, top.error_code);
        self.stats.lock().injected += 1;
        log::trace!(
            "vcpu {}: injecting {:?} vector {:#x}",
            cb.vcpu_id,
            top.kind,
            top.vector
        );
    }

    pub fn stats(&self) -> InterruptStats {
        *self.stats.lock()
    }
}
