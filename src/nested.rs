//! Nested Virtualization (single extra level)
//!
//! A guest hypervisor (L1) can enter its own guest (L2) by executing a
//! nested-entry action carrying a guest-owned control description: an
//! intercept mask over the common exit classes plus the L2 register state.
//! The effective controls for L2 merge the guest's requests with the
//! intercepts the host itself cannot give up. While L2 runs, each exit is
//! routed by ownership: classes the L1 asked to intercept are reflected back
//! to L1 as a synthetic exit, everything else is handled by the host with L2
//! kept active.

use crate::backend::ExitClass;
use crate::vcpu::VcpuState;

/// Exit classes the host always intercepts for itself, whatever L1 asks for.
/// Memory faults drive the host's own translation tables and I/O must reach
/// host device models.
pub const MANDATORY_HOST_INTERCEPTS: u64 =
    ExitClass::MemoryFault.bit() | ExitClass::PortIo.bit() | ExitClass::Unknown.bit();

/// Guest-owned description of an L2 entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedDescriptor {
    /// Requested intercepts, a bitmask over [`ExitClass`] bits.
    pub intercepts: u64,
    /// L2 architectural state to load on entry.
    pub guest: VcpuState,
}

impl NestedDescriptor {
    pub fn new(intercepts: u64, guest: VcpuState) -> Self {
        Self { intercepts, guest }
    }
}

/// Effective L2 controls: the union of guest-requested intercepts and the
/// host's mandatory set. Never the guest's mask verbatim.
pub fn merge_controls(desc: &NestedDescriptor) -> u64 {
    desc.intercepts | MANDATORY_HOST_INTERCEPTS
}

/// Active L2 context hanging off a vCPU.
#[derive(Debug, Clone)]
pub struct NestedState {
    pub descriptor: NestedDescriptor,
    pub merged_intercepts: u64,
    /// L1 state saved at nested entry, restored on reflection.
    pub saved_l1: VcpuState,
}

impl NestedState {
    pub fn enter(desc: NestedDescriptor, saved_l1: VcpuState) -> Self {
        let merged_intercepts = merge_controls(&desc);
        Self { descriptor: desc, merged_intercepts, saved_l1 }
    }

    /// Whether an L2 exit of this class belongs to L1. Host-mandatory classes
    /// are always serviced by the host first, even when L1 also asked for
    /// them; everything else reflects iff L1 requested the intercept.
    pub fn should_reflect(&self, class: ExitClass) -> bool {
        if MANDATORY_HOST_INTERCEPTS & class.bit() != 0 {
            return false;
        }
        self.descriptor.intercepts & class.bit() != 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NestedStats {
    pub entries: u64,
    pub reflected: u64,
    pub host_handled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_always_keeps_host_intercepts() {
        let desc = NestedDescriptor::new(0, VcpuState::default());
        assert_eq!(merge_controls(&desc), MANDATORY_HOST_INTERCEPTS);

        let desc = NestedDescriptor::new(ExitClass::Hlt.bit(), VcpuState::default());
        let merged = merge_controls(&desc);
        assert_ne!(merged & MANDATORY_HOST_INTERCEPTS, 0);
        assert_ne!(merged & ExitClass::Hlt.bit(), 0);
    }

    #[test]
    fn test_reflection_ownership() {
        let desc = NestedDescriptor::new(
            ExitClass::Hlt.bit() | ExitClass::Hypercall.bit() | ExitClass::MemoryFault.bit(),
            VcpuState::default(),
        );
        let state = NestedState::enter(desc, VcpuState::default());

        assert!(state.should_reflect(ExitClass::Hlt));
        assert!(state.should_reflect(ExitClass::Hypercall));
        // Host-mandatory classes never reflect, even when requested.
        assert!(!state.should_reflect(ExitClass::MemoryFault));
        assert!(!state.should_reflect(ExitClass::PortIo));
        // Not requested, not mandatory: host keeps it.
        assert!(!state.should_reflect(ExitClass::InterruptWindow));
    }
}
