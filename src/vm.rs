//! Virtual Machine & Manager
//!
//! The VM object ties the pieces together: backend selection, the
//! copy-on-write slot table feeding the translation engine, the vCPU arena,
//! the I/O bus, and interrupt-line routing. A process-wide registry maps VM
//! identifiers to live VMs so embedding code can reach any VM by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::backend::HardwareBackend;
use crate::bus::{BusError, IoBus};
use crate::interrupts::{EventKind, PendingEvent};
use crate::memory::{Gfn, GuestMmu, Hfn, MemorySlot, SlotFlags, SlotTable};
use crate::runner::{self, RunExit};
use crate::svm::SvmBackend;
use crate::vcpu::{HaltPollConfig, VcpuMode, VirtualCpu};
use crate::vmx::VtxBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(pub u64);

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which virtualization extension to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Pick the first available extension at creation time.
    #[default]
    Auto,
    Vtx,
    Svm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    Running,
    ShuttingDown,
    /// Terminal. Entered when a vCPU suffers a hardware entry failure.
    Dead,
}

#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub backend: BackendKind,
    pub halt_poll: HaltPollConfig,
    pub max_vcpus: u32,
}

impl VmConfig {
    pub fn with_backend(backend: BackendKind) -> Self {
        Self { backend, ..Default::default() }
    }
}

const DEFAULT_MAX_VCPUS: u32 = 16;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("memory region overlaps an existing slot")]
    OverlappingRegion,
    #[error("memory region wraps the frame space")]
    RegionWraps,
    #[error("no memory slot with id {0}")]
    InvalidSlot(u32),
    #[error("dirty logging is not enabled on slot {0}")]
    DirtyLogNotEnabled(u32),
    #[error("no vcpu with id {0}")]
    NoSuchVcpu(u32),
    #[error("vcpu limit reached ({0})")]
    TooManyVcpus(u32),
    #[error("no interrupt route for line {0}")]
    NoSuchRoute(u32),
    #[error("no vm with id {0}")]
    NoSuchVm(VmId),
    #[error("a vcpu is still between entry and exit")]
    VcpuActive,
    #[error("bus registration failed: {0}")]
    Bus(#[from] BusError),
}

pub type VmResult<T> = Result<T, VmError>;

/// One interrupt-line route: line number to vCPU, vector, and event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqRoute {
    pub vcpu: u32,
    pub vector: u8,
    pub kind: EventKind,
}

pub struct VirtualMachine {
    pub id: VmId,
    config: VmConfig,
    backend: Arc<dyn HardwareBackend>,
    slots: RwLock<Arc<SlotTable>>,
    generation: AtomicU64,
    mmu: Arc<GuestMmu>,
    vcpus: RwLock<Vec<Arc<VirtualCpu>>>,
    bus: IoBus,
    routes: RwLock<HashMap<u32, IrqRoute>>,
    state: Mutex<VmState>,
}

impl VirtualMachine {
    fn new(id: VmId, mut config: VmConfig) -> Arc<Self> {
        if config.max_vcpus == 0 {
            config.max_vcpus = DEFAULT_MAX_VCPUS;
        }
        let backend: Arc<dyn HardwareBackend> = match config.backend {
            BackendKind::Vtx => Arc::new(VtxBackend),
            BackendKind::Svm => Arc::new(SvmBackend),
            // Both extensions are modeled as present; prefer VT-x.
            BackendKind::Auto => Arc::new(VtxBackend),
        };
        log::info!("vm {}: created ({} backend)", id, backend.name());
        Arc::new(Self {
            id,
            config,
            backend,
            slots: RwLock::new(Arc::new(SlotTable::empty())),
            generation: AtomicU64::new(0),
            mmu: Arc::new(GuestMmu::new()),
            vcpus: RwLock::new(Vec::new()),
            bus: IoBus::new(),
            routes: RwLock::new(HashMap::new()),
            state: Mutex::new(VmState::Created),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn backend(&self) -> &Arc<dyn HardwareBackend> {
        &self.backend
    }

    /// Immutable snapshot of the current slot table.
    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.slots.read().clone()
    }

    pub fn mmu(&self) -> &Arc<GuestMmu> {
        &self.mmu
    }

    pub fn bus(&self) -> &IoBus {
        &self.bus
    }

    /// Register a device model on the I/O bus.
    pub fn register_device(
        &self,
        range: crate::bus::BusRange,
        device: Arc<dyn crate::bus::BusDevice>,
    ) -> VmResult<()> {
        self.bus.register(range, device)?;
        Ok(())
    }

    // ===== Memory regions =====

    /// Create, replace, or delete (frames == 0) a memory slot.
    ///
    /// Validation happens against a candidate table; on any error the
    /// published table is untouched. Publication bumps the generation and
    /// invalidates stale translations before returning.
    pub fn set_memory_region(
        &self,
        slot_id: u32,
        base_gfn: Gfn,
        frames: u64,
        host_base: Hfn,
        flags: SlotFlags,
    ) -> VmResult<()> {
        let mut slots = self.slots.write();
        let existing = slots.find_by_id(slot_id).is_some();

        let mut candidate: Vec<Arc<MemorySlot>> =
            slots.slots().iter().filter(|s| s.id != slot_id).cloned().collect();

        if frames == 0 {
            if !existing {
                return Err(VmError::InvalidSlot(slot_id));
            }
        } else {
            // Reject wrapping regions before any range arithmetic runs.
            if base_gfn.checked_add(frames).is_none() || host_base.checked_add(frames).is_none() {
                return Err(VmError::RegionWraps);
            }
            if candidate.iter().any(|s| s.overlaps(base_gfn, frames)) {
                return Err(VmError::OverlappingRegion);
            }
            candidate.push(Arc::new(MemorySlot::new(slot_id, base_gfn, frames, host_base, flags)));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *slots = Arc::new(SlotTable::new(generation, candidate));
        drop(slots);

        // Old translations through this slot id must not survive the change.
        if existing {
            self.mmu.invalidate_slot(slot_id);
        }
        log::debug!(
            "vm {}: slot {} {} (gfn {:#x}+{:#x}), generation {}",
            self.id,
            slot_id,
            if frames == 0 { "deleted" } else { "set" },
            base_gfn,
            frames,
            generation
        );
        Ok(())
    }

    /// Harvest and clear the dirty log of `slot_id`, re-arming tracking.
    pub fn dirty_log(&self, slot_id: u32) -> VmResult<Vec<Gfn>> {
        let table = self.slot_table();
        let slot = table.find_by_id(slot_id).ok_or(VmError::InvalidSlot(slot_id))?;
        if !slot.dirty_logged() {
            return Err(VmError::DirtyLogNotEnabled(slot_id));
        }
        Ok(self.mmu.harvest_dirty(slot))
    }

    // ===== vCPUs =====

    /// Create the next vCPU; ids are dense, starting at 0.
    pub fn create_vcpu(&self) -> VmResult<Arc<VirtualCpu>> {
        let mut vcpus = self.vcpus.write();
        let id = vcpus.len() as u32;
        if id >= self.config.max_vcpus {
            return Err(VmError::TooManyVcpus(self.config.max_vcpus));
        }
        let vcpu = Arc::new(VirtualCpu::new(
            id,
            self.id.0,
            self.backend.clone(),
            self.mmu.clone(),
            self.config.halt_poll,
        ));
        log::debug!("vm {}: created vcpu {}", self.id, id);
        vcpus.push(vcpu.clone());
        Ok(vcpu)
    }

    pub fn vcpu(&self, id: u32) -> Option<Arc<VirtualCpu>> {
        self.vcpus.read().get(id as usize).cloned()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().len()
    }

    /// Drive `vcpu_id` until a slow exit. The calling thread becomes the
    /// vCPU's runner thread for the duration.
    pub fn run(&self, vcpu_id: u32) -> VmResult<RunExit> {
        let vcpu = self.vcpu(vcpu_id).ok_or(VmError::NoSuchVcpu(vcpu_id))?;
        {
            let mut state = self.state.lock();
            match *state {
                VmState::Dead => return Ok(RunExit::Dead),
                VmState::Created => *state = VmState::Running,
                _ => {}
            }
        }
        Ok(runner::run_vcpu(self, &vcpu))
    }

    // ===== Interrupts =====

    pub fn inject_interrupt(&self, vcpu_id: u32, vector: u8) -> VmResult<()> {
        let vcpu = self.vcpu(vcpu_id).ok_or(VmError::NoSuchVcpu(vcpu_id))?;
        vcpu.enqueue_event(PendingEvent::interrupt(vector));
        Ok(())
    }

    pub fn inject_nmi(&self, vcpu_id: u32) -> VmResult<()> {
        let vcpu = self.vcpu(vcpu_id).ok_or(VmError::NoSuchVcpu(vcpu_id))?;
        vcpu.enqueue_event(PendingEvent::nmi());
        Ok(())
    }

    pub fn inject_exception(&self, vcpu_id: u32, vector: u8, error_code: Option<u32>) -> VmResult<()> {
        let vcpu = self.vcpu(vcpu_id).ok_or(VmError::NoSuchVcpu(vcpu_id))?;
        vcpu.enqueue_event(PendingEvent::exception(vector, error_code));
        Ok(())
    }

    /// Map an interrupt line to a vCPU and vector.
    pub fn set_irq_route(&self, line: u32, route: IrqRoute) {
        self.routes.write().insert(line, route);
    }

    /// Assert an interrupt line, queueing its routed event.
    pub fn trigger_line(&self, line: u32) -> VmResult<()> {
        let route = self.routes.read().get(&line).copied().ok_or(VmError::NoSuchRoute(line))?;
        let vcpu = self.vcpu(route.vcpu).ok_or(VmError::NoSuchVcpu(route.vcpu))?;
        let event = match route.kind {
            EventKind::Interrupt => PendingEvent::interrupt(route.vector),
            EventKind::Nmi => PendingEvent::nmi(),
            EventKind::Exception => PendingEvent::exception(route.vector, None),
        };
        vcpu.enqueue_event(event);
        Ok(())
    }

    // ===== Lifecycle =====

    /// Ask every vCPU runner to return at the next exit boundary.
    pub fn request_shutdown(&self) {
        for vcpu in self.vcpus.read().iter() {
            vcpu.request_exit();
        }
        let mut state = self.state.lock();
        if *state != VmState::Dead {
            *state = VmState::ShuttingDown;
        }
        log::info!("vm {}: shutdown requested", self.id);
    }

    /// Terminal transition, taken when hardware refuses entry on a vCPU.
    pub(crate) fn mark_dead(&self) {
        *self.state.lock() = VmState::Dead;
        log::error!("vm {}: marked dead", self.id);
    }

    fn all_vcpus_outside(&self) -> bool {
        self.vcpus.read().iter().all(|v| v.mode() == VcpuMode::Outside)
    }
}

// ===== Process-wide registry =====

lazy_static! {
    static ref VM_REGISTRY: RwLock<HashMap<u64, Arc<VirtualMachine>>> = RwLock::new(HashMap::new());
}

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Create a VM and register it under a fresh id.
pub fn create_vm(config: VmConfig) -> Arc<VirtualMachine> {
    let id = VmId(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed));
    let vm = VirtualMachine::new(id, config);
    VM_REGISTRY.write().insert(id.0, vm.clone());
    vm
}

pub fn lookup_vm(id: VmId) -> Option<Arc<VirtualMachine>> {
    VM_REGISTRY.read().get(&id.0).cloned()
}

/// Unregister a VM. Every vCPU must be outside guest mode; runner threads
/// still holding the Arc keep the object alive until they drop it.
pub fn destroy_vm(id: VmId) -> VmResult<()> {
    let mut registry = VM_REGISTRY.write();
    let vm = registry.get(&id.0).ok_or(VmError::NoSuchVm(id))?;
    if !vm.all_vcpus_outside() {
        return Err(VmError::VcpuActive);
    }
    vm.request_shutdown();
    registry.remove(&id.0);
    log::info!("vm {}: destroyed", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GuestAction;
    use crate::bus::{BusDevice, BusRange, IoDirection};
    use crate::interrupts::EventKind;
    use crate::memory::PAGE_SHIFT;
    use crate::nested::NestedDescriptor;
    use crate::vcpu::VcpuState;
    use std::time::Duration;

    fn ram_vm() -> Arc<VirtualMachine> {
        let vm = create_vm(VmConfig::default());
        vm.set_memory_region(0, 0x100, 0x10, 0x5000, SlotFlags::empty()).unwrap();
        vm
    }

    // Terminator that surfaces a slow exit without touching RAX.
    fn term() -> GuestAction {
        GuestAction::PortIn { port: 0xEF, width: 1 }
    }

    #[test]
    fn test_translation_fault_fast_path() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        let gpa = 0x105 << PAGE_SHIFT;
        vcpu.program_guest([
            GuestAction::MemWrite { gpa, width: 8, data: 0xAB },
            GuestAction::Hypercall { nr: 7, args: vec![1, 2] },
        ]);
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr, args } => {
                assert_eq!(nr, 7);
                assert_eq!(args, vec![1, 2]);
            }
            other => panic!("unexpected exit: {:?}", other),
        }
        // The faulting write was resolved in-process and retired on re-entry.
        let mapping = vm.mmu().lookup(0x105).expect("mapping installed");
        assert_eq!(mapping.hfn, 0x5005);
        let stats = vcpu.stats();
        assert!(stats.fast_exits >= 1);
        assert_eq!(stats.exits_by_class[crate::backend::ExitClass::MemoryFault as usize], 1);
        assert_eq!(stats.exits_by_class[crate::backend::ExitClass::Hypercall as usize], 1);
    }

    #[test]
    fn test_unclaimed_mmio_surfaces_to_caller() {
        for backend in [BackendKind::Vtx, BackendKind::Svm] {
            let vm = create_vm(VmConfig::with_backend(backend));
            vm.set_memory_region(0, 0x100, 0x10, 0x5000, SlotFlags::empty()).unwrap();
            vm.create_vcpu().unwrap();
            vm.vcpu(0).unwrap().program_guest([GuestAction::MemWrite {
                gpa: 0xFEE0_0000,
                width: 4,
                data: 0x1234,
            }]);
            match vm.run(0).unwrap() {
                RunExit::MmioAccess { gpa, direction, width, data } => {
                    assert_eq!(gpa, 0xFEE0_0000);
                    assert_eq!(direction, IoDirection::Write);
                    assert_eq!(width, 4);
                    assert_eq!(data, Some(0x1234));
                }
                other => panic!("unexpected exit: {:?}", other),
            }
            // Nothing was installed for the unbacked frame.
            assert!(vm.mmu().lookup(0xFEE0_0000 >> PAGE_SHIFT).is_none());
        }
    }

    #[test]
    fn test_priority_delivery_across_entries() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        // Two interrupts queued while the guest has interrupts disabled; the
        // lower vector wins the first opportunity, the other the next one.
        vm.inject_interrupt(0, 0x40).unwrap();
        vm.inject_interrupt(0, 0x30).unwrap();
        vcpu.program_guest([
            GuestAction::SetInterruptFlag(true),
            GuestAction::SetInterruptFlag(true),
            GuestAction::Hypercall { nr: 1, args: vec![] },
        ]);
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr: 1, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }
        vcpu.program_guest([GuestAction::Hypercall { nr: 2, args: vec![] }]);
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr: 2, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }
        let cb = vcpu.cb.lock();
        let vectors: Vec<u8> = cb.delivered_events().iter().map(|e| e.vector).collect();
        assert_eq!(vectors, vec![0x30, 0x40]);
    }

    #[test]
    fn test_bus_handled_mmio_read() {
        struct FixedReg;
        impl BusDevice for FixedReg {
            fn name(&self) -> &str {
                "fixed"
            }
            fn read(&self, _addr: u64, _width: u8) -> Option<u64> {
                Some(0x99)
            }
        }

        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        vm.register_device(BusRange::mmio(0xFEB0_0000, 0x1000), Arc::new(FixedReg)).unwrap();
        vcpu.program_guest([GuestAction::MemRead { gpa: 0xFEB0_0010, width: 4 }, term()]);
        match vm.run(0).unwrap() {
            RunExit::PioAccess { port: 0xEF, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }
        assert_eq!(vcpu.get_state().unwrap().regs.rax, 0x99);
    }

    #[test]
    fn test_readonly_slot_write_escalates_past_devices() {
        struct WriteSink {
            hits: parking_lot::Mutex<u32>,
        }
        impl BusDevice for WriteSink {
            fn name(&self) -> &str {
                "sink"
            }
            fn write(&self, _addr: u64, _width: u8, _data: u64) -> bool {
                *self.hits.lock() += 1;
                true
            }
        }

        let vm = create_vm(VmConfig::default());
        vm.set_memory_region(0, 0x200, 0x10, 0x6000, SlotFlags::READ_ONLY).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        let gpa = 0x200 << PAGE_SHIFT;
        // A device claiming the same range must never see the write; the
        // slot owns the address and its permissions decide.
        let sink = Arc::new(WriteSink { hits: parking_lot::Mutex::new(0) });
        vm.register_device(BusRange::mmio(gpa, 0x1000), sink.clone()).unwrap();
        vcpu.program_guest([
            GuestAction::MemWrite { gpa, width: 8, data: 1 },
            GuestAction::Hypercall { nr: 1, args: vec![] },
        ]);
        match vm.run(0).unwrap() {
            RunExit::MemoryFault { gpa: fault_gpa, width: 8, .. } => {
                assert_eq!(fault_gpa, gpa);
            }
            other => panic!("unexpected exit: {:?}", other),
        }
        assert_eq!(*sink.hits.lock(), 0, "device must not swallow the write");
        assert!(!vcpu.is_dead());

        // The access was left pending; dropping the write protection lets
        // it replay and the guest run on.
        vm.set_memory_region(0, 0x200, 0x10, 0x6000, SlotFlags::empty()).unwrap();
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr: 1, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }
        assert_eq!(*sink.hits.lock(), 0);
    }

    #[test]
    fn test_interrupt_window_delivery() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        // Guest starts with interrupts disabled; the queued interrupt must
        // wait for the window instead of injecting blindly.
        vm.inject_interrupt(0, 0x41).unwrap();
        vcpu.program_guest([
            GuestAction::SetInterruptFlag(true),
            GuestAction::Hypercall { nr: 1, args: vec![] },
        ]);
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr: 1, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }
        let cb = vcpu.cb.lock();
        assert_eq!(cb.delivered_events().len(), 1);
        assert_eq!(cb.delivered_events()[0].kind, EventKind::Interrupt);
        assert_eq!(cb.delivered_events()[0].vector, 0x41);
    }

    #[test]
    fn test_dirty_log_harvest_cycle() {
        let vm = create_vm(VmConfig::default());
        vm.set_memory_region(0, 0x100, 0x10, 0x5000, SlotFlags::DIRTY_LOG).unwrap();
        vm.create_vcpu().unwrap();
        let vcpu = vm.vcpu(0).unwrap();
        let gpa1 = 0x101 << PAGE_SHIFT;
        let gpa2 = 0x102 << PAGE_SHIFT;
        vcpu.program_guest([
            GuestAction::MemWrite { gpa: gpa1, width: 8, data: 1 },
            GuestAction::MemWrite { gpa: gpa1, width: 8, data: 2 },
            GuestAction::MemWrite { gpa: gpa2, width: 8, data: 3 },
            term(),
        ]);
        vm.run(0).unwrap();

        let mut dirty = vm.dirty_log(0).unwrap();
        dirty.sort_unstable();
        assert_eq!(dirty, vec![0x101, 0x102], "one mark per frame per episode");
        assert!(vm.dirty_log(0).unwrap().is_empty(), "harvest clears the log");

        // Harvest re-armed tracking: the next write episode shows up again.
        vcpu.program_guest([GuestAction::MemWrite { gpa: gpa1, width: 8, data: 4 }, term()]);
        vm.run(0).unwrap();
        assert_eq!(vm.dirty_log(0).unwrap(), vec![0x101]);
    }

    #[test]
    fn test_dirty_log_requires_flag() {
        let vm = ram_vm();
        assert!(matches!(vm.dirty_log(0), Err(VmError::DirtyLogNotEnabled(0))));
        assert!(matches!(vm.dirty_log(9), Err(VmError::InvalidSlot(9))));
    }

    #[test]
    fn test_entry_failure_marks_vcpu_dead() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        vcpu.cb.lock().poison(crate::backend::entry_diag::INVALID_GUEST_STATE);
        match vm.run(0).unwrap() {
            RunExit::EntryFailure { code } => {
                assert_eq!(code, crate::backend::entry_diag::INVALID_GUEST_STATE);
            }
            other => panic!("unexpected exit: {:?}", other),
        }
        assert!(vcpu.is_dead());
        assert!(vcpu.death_diagnostic().is_some());
        assert_eq!(vm.state(), VmState::Dead);
        assert_eq!(vm.run(0).unwrap(), RunExit::Dead);
        // Dead is terminal; a shutdown request does not revive the VM.
        vm.request_shutdown();
        assert_eq!(vm.state(), VmState::Dead);
    }

    #[test]
    fn test_nested_entry_and_reflection() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();

        let mut l1 = VcpuState::default();
        l1.regs.rip = 0x1000;
        vcpu.set_state(&l1).unwrap();

        let mut l2 = VcpuState::default();
        l2.regs.rip = 0x2000;
        let desc = NestedDescriptor::new(crate::backend::ExitClass::Hlt.bit(), l2);

        vcpu.program_guest([
            GuestAction::NestedEnter(desc),
            GuestAction::Halt,
            GuestAction::Hypercall { nr: 3, args: vec![] },
        ]);
        match vm.run(0).unwrap() {
            RunExit::Hypercall { nr: 3, .. } => {}
            other => panic!("unexpected exit: {:?}", other),
        }

        let stats = vcpu.nested_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.reflected, 1, "L2 halt belongs to the guest hypervisor");
        assert!(!vcpu.nested_active());
        // Reflection restored the L1 register state.
        assert_eq!(vcpu.get_state().unwrap().regs.rip, 0x1000);
    }

    #[test]
    fn test_nested_host_keeps_mandatory_intercepts() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        // L1 asks to intercept memory faults; the host services them anyway.
        let desc = NestedDescriptor::new(
            crate::backend::ExitClass::MemoryFault.bit(),
            VcpuState::default(),
        );
        let gpa = 0x108 << PAGE_SHIFT;
        vcpu.program_guest([
            GuestAction::NestedEnter(desc),
            GuestAction::MemWrite { gpa, width: 8, data: 5 },
            term(),
        ]);
        vm.run(0).unwrap();
        assert!(vm.mmu().lookup(0x108).is_some());
        assert!(vcpu.nested_active(), "no reflection happened");
        assert!(vcpu.nested_stats().host_handled >= 1);
    }

    #[test]
    fn test_irq_routing() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        vm.set_irq_route(4, IrqRoute { vcpu: 0, vector: 0x30, kind: EventKind::Interrupt });
        vm.set_irq_route(2, IrqRoute { vcpu: 0, vector: 0, kind: EventKind::Nmi });

        vm.trigger_line(4).unwrap();
        assert!(vcpu.events.has_pending());
        // A maskable interrupt alone is not deliverable with IF clear.
        assert!(!vcpu.events.has_deliverable(false));

        // An NMI-kind line is deliverable regardless of the interrupt flag.
        vm.trigger_line(2).unwrap();
        assert!(vcpu.events.has_deliverable(false));

        assert!(matches!(vm.trigger_line(9), Err(VmError::NoSuchRoute(9))));
    }

    #[test]
    fn test_halted_vcpu_stopped_from_another_thread() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        let runner_vm = vm.clone();
        let handle = std::thread::spawn(move || runner_vm.run(0).unwrap());
        std::thread::sleep(Duration::from_millis(30));
        vcpu.request_exit();
        assert_eq!(handle.join().unwrap(), RunExit::Stopped);
    }

    #[test]
    fn test_overlapping_region_rejected_without_mutation() {
        let vm = ram_vm();
        let before = vm.slot_table();
        assert!(matches!(
            vm.set_memory_region(1, 0x108, 0x10, 0x7000, SlotFlags::empty()),
            Err(VmError::OverlappingRegion)
        ));
        let after = vm.slot_table();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.slots().len(), 1);

        // Replacing the same slot id is allowed; deleting a missing id is not.
        vm.set_memory_region(0, 0x100, 0x20, 0x5000, SlotFlags::empty()).unwrap();
        assert!(matches!(
            vm.set_memory_region(5, 0, 0, 0, SlotFlags::empty()),
            Err(VmError::InvalidSlot(5))
        ));
    }

    #[test]
    fn test_halted_vcpu_parks_on_masked_interrupt() {
        let vm = ram_vm();
        let vcpu = vm.create_vcpu().unwrap();
        // IF starts clear; the queued interrupt cannot be taken, so the
        // runner must park instead of re-entering over and over.
        vm.inject_interrupt(0, 0x20).unwrap();
        let runner_vm = vm.clone();
        let handle = std::thread::spawn(move || runner_vm.run(0).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        vcpu.request_exit();
        assert_eq!(handle.join().unwrap(), RunExit::Stopped);
        assert!(vcpu.stats().entries <= 3, "entries: {}", vcpu.stats().entries);
        assert!(vcpu.events.has_pending(), "the masked interrupt stays queued");
    }

    #[test]
    fn test_wrapping_region_rejected() {
        let vm = create_vm(VmConfig::default());
        assert!(matches!(
            vm.set_memory_region(0, u64::MAX - 1, 0x10, 0x5000, SlotFlags::empty()),
            Err(VmError::RegionWraps)
        ));
        assert!(matches!(
            vm.set_memory_region(0, 0x100, 0x10, u64::MAX - 1, SlotFlags::empty()),
            Err(VmError::RegionWraps)
        ));
        assert!(vm.slot_table().slots().is_empty());
    }

    #[test]
    fn test_vcpu_limit() {
        let vm = create_vm(VmConfig { max_vcpus: 2, ..Default::default() });
        vm.create_vcpu().unwrap();
        vm.create_vcpu().unwrap();
        assert!(matches!(vm.create_vcpu(), Err(VmError::TooManyVcpus(2))));
        assert_eq!(vm.vcpu_count(), 2);
    }

    #[test]
    fn test_registry_lifecycle() {
        let vm = create_vm(VmConfig::default());
        let id = vm.id;
        assert!(lookup_vm(id).is_some());
        destroy_vm(id).unwrap();
        assert!(lookup_vm(id).is_none());
        assert!(matches!(destroy_vm(id), Err(VmError::NoSuchVm(_))));
        assert_eq!(vm.state(), VmState::ShuttingDown);
    }
}
