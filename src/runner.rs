//! vCPU Run Loop
//!
//! Drives one vCPU: event injection, guest entry, exit classification, and
//! the fast/slow split. Exits the loop can fully service in-process
//! (translation faults, bus-handled I/O, halts, interrupt windows, nested
//! transitions) are absorbed without returning; everything else is surfaced
//! to the caller as a [`RunExit`]. Internal consistency violations mark the
//! vCPU dead and produce a diagnostic result instead of panicking.

use crate::backend::ExitPayload;
use crate::bus::{BusResult, BusSpace, IoDirection};
use crate::memory::{Access, FaultResolution, PAGE_SHIFT};
use crate::nested::NestedState;
use crate::vcpu::{VcpuMode, VirtualCpu};
use crate::vm::VirtualMachine;

/// Why `run` returned to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// MMIO access no device model claimed. For reads the caller supplies
    /// the result by writing the destination register before re-running.
    MmioAccess { gpa: u64, direction: IoDirection, width: u8, data: Option<u64> },
    /// Port I/O access no device model claimed.
    PioAccess { port: u16, direction: IoDirection, width: u8, count: u32, data: Option<u64> },
    /// Access a mapped slot's permissions reject. Never offered to device
    /// models; the faulting access is left pending so it replays after the
    /// caller adjusts the slot.
    MemoryFault { gpa: u64, access: Access, width: u8, data: Option<u64> },
    /// Exit reason the backend could not classify, surfaced raw.
    UnknownExit { raw: u64 },
    /// Guest-initiated call to the external manager.
    Hypercall { nr: u64, args: Vec<u64> },
    /// Hardware refused entry; the vCPU is dead.
    EntryFailure { code: u32 },
    /// Internal consistency violation; the vCPU is dead.
    InternalError { diagnostic: String },
    /// An exit was requested via [`VirtualCpu::request_exit`].
    Stopped,
    /// The vCPU was already dead when `run` was called.
    Dead,
}

pub(crate) fn run_vcpu(vm: &VirtualMachine, vcpu: &VirtualCpu) -> RunExit {
    loop {
        if vcpu.is_dead() {
            return RunExit::Dead;
        }
        if vcpu.take_exit_request() {
            return RunExit::Stopped;
        }

        let entered = {
            let mut cb = vcpu.cb.lock();
            vcpu.events.prepare_injection(&mut cb);
            vcpu.set_mode(VcpuMode::InGuest);
            vcpu.stats.lock().entries += 1;
            let result = vcpu.backend().enter(&mut cb);
            vcpu.set_mode(VcpuMode::Exiting);
            result
        };

        let raw = match entered {
            Ok(raw) => raw,
            Err(failure) => {
                vcpu.set_mode(VcpuMode::Outside);
                vcpu.mark_dead(format!("entry failure: {}", failure));
                vm.mark_dead();
                return RunExit::EntryFailure { code: failure.code };
            }
        };
        vcpu.stats.lock().exits += 1;

        let payload = {
            let cb = vcpu.cb.lock();
            vcpu.backend().read_exit_info(&cb)
        };
        vcpu.stats.lock().exits_by_class[payload.class() as usize] += 1;
        log::trace!("vcpu {}/{}: exit {:#x} -> {:?}", vcpu.vm_id, vcpu.id, raw, payload.class());

        // L2 exits the guest hypervisor asked to intercept reflect back to
        // L1 instead of being serviced here.
        let reflect_to = {
            let mut nested = vcpu.nested.lock();
            match nested.as_ref() {
                Some(state) if state.should_reflect(payload.class()) => {
                    let saved = state.saved_l1.clone();
                    *nested = None;
                    Some(saved)
                }
                Some(_) => {
                    vcpu.nested_stats.lock().host_handled += 1;
                    None
                }
                None => None,
            }
        };
        if let Some(saved) = reflect_to {
            let mut cb = vcpu.cb.lock();
            vcpu.backend().load(&mut cb, &saved);
            drop(cb);
            vcpu.nested_stats.lock().reflected += 1;
            vcpu.stats.lock().fast_exits += 1;
            vcpu.set_mode(VcpuMode::Outside);
            continue;
        }

        match payload {
            ExitPayload::MemoryFault { gpa, access, width, data } => {
                let table = vm.slot_table();
                let resolution = {
                    let mut cache = vcpu.cache.lock();
                    vm.mmu().handle_fault(&table, Some(&mut *cache), gpa >> PAGE_SHIFT, access)
                };
                match resolution {
                    FaultResolution::Resolved => {
                        vcpu.stats.lock().fast_exits += 1;
                        vcpu.set_mode(VcpuMode::Outside);
                    }
                    FaultResolution::MmioAccess => {
                        let direction = if access.contains(Access::WRITE) {
                            IoDirection::Write
                        } else {
                            IoDirection::Read
                        };
                        let handled = match direction {
                            IoDirection::Read => vm.bus().read(BusSpace::Mmio, gpa, width),
                            IoDirection::Write => {
                                vm.bus().write(BusSpace::Mmio, gpa, width, data.unwrap_or(0))
                            }
                        };
                        let mut cb = vcpu.cb.lock();
                        cb.retire_front_action();
                        match handled {
                            BusResult::Handled(read_data) => {
                                if let Some(value) = read_data {
                                    cb.guest_mut().regs.rax = value;
                                }
                                drop(cb);
                                vcpu.stats.lock().fast_exits += 1;
                                vcpu.set_mode(VcpuMode::Outside);
                            }
                            BusResult::Unhandled => {
                                drop(cb);
                                vcpu.stats.lock().slow_exits += 1;
                                vcpu.set_mode(VcpuMode::Outside);
                                return RunExit::MmioAccess { gpa, direction, width, data };
                            }
                        }
                    }
                    FaultResolution::Unresolved(fault) => {
                        // Permission violations are not MMIO; the owning slot
                        // exists and no device model gets a say.
                        log::debug!("vcpu {}/{}: {}", vcpu.vm_id, vcpu.id, fault);
                        vcpu.stats.lock().slow_exits += 1;
                        vcpu.set_mode(VcpuMode::Outside);
                        return RunExit::MemoryFault { gpa, access, width, data };
                    }
                    FaultResolution::Inconsistent(diagnostic) => {
                        vcpu.set_mode(VcpuMode::Outside);
                        vcpu.mark_dead(diagnostic.clone());
                        return RunExit::InternalError { diagnostic };
                    }
                }
            }
            ExitPayload::PioAccess { port, width, direction, count, data } => {
                let handled = match direction {
                    IoDirection::Read => vm.bus().read(BusSpace::Pio, port as u64, width),
                    IoDirection::Write => {
                        vm.bus().write(BusSpace::Pio, port as u64, width, data.unwrap_or(0))
                    }
                };
                match handled {
                    BusResult::Handled(read_data) => {
                        if let Some(value) = read_data {
                            vcpu.cb.lock().guest_mut().regs.rax = value;
                        }
                        vcpu.stats.lock().fast_exits += 1;
                        vcpu.set_mode(VcpuMode::Outside);
                    }
                    BusResult::Unhandled => {
                        vcpu.stats.lock().slow_exits += 1;
                        vcpu.set_mode(VcpuMode::Outside);
                        return RunExit::PioAccess { port, direction, width, count, data };
                    }
                }
            }
            ExitPayload::Hlt => {
                // Block until an event or an exit request arrives; the loop
                // top services the exit request, injection handles the event.
                vcpu.stats.lock().fast_exits += 1;
                vcpu.set_mode(VcpuMode::Outside);
                let guest_if = vcpu.cb.lock().guest_if();
                if !vcpu.events.has_deliverable(guest_if) {
                    vcpu.halt_wait(guest_if);
                }
            }
            ExitPayload::InterruptWindow => {
                // Re-entering goes through injection with the window now open.
                vcpu.stats.lock().fast_exits += 1;
                vcpu.set_mode(VcpuMode::Outside);
            }
            ExitPayload::Hypercall { nr, args } => {
                vcpu.stats.lock().slow_exits += 1;
                vcpu.set_mode(VcpuMode::Outside);
                return RunExit::Hypercall { nr, args };
            }
            ExitPayload::NestedEntry(desc) => {
                let mut cb = vcpu.cb.lock();
                let saved_l1 = vcpu.backend().save(&cb);
                vcpu.backend().load(&mut cb, &desc.guest);
                drop(cb);
                *vcpu.nested.lock() = Some(NestedState::enter(desc, saved_l1));
                vcpu.nested_stats.lock().entries += 1;
                vcpu.stats.lock().fast_exits += 1;
                vcpu.set_mode(VcpuMode::Outside);
            }
            ExitPayload::Unknown { raw } => {
                // Not a consistency violation; the caller decides what an
                // unrecognized reason means for this guest.
                log::debug!("vcpu {}/{}: unclassified exit {:#x}", vcpu.vm_id, vcpu.id, raw);
                vcpu.stats.lock().slow_exits += 1;
                vcpu.set_mode(VcpuMode::Outside);
                return RunExit::UnknownExit { raw };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CbFormat, ControlBlock, EntryFailure, HardwareBackend};
    use crate::memory::TranslationWalker;
    use crate::vcpu::{HaltPollConfig, VcpuState};
    use crate::vm::{create_vm, VmConfig};
    use std::sync::Arc;

    // Backend whose every entry exits with a reason outside the known set.
    struct OpaqueExitBackend;

    impl HardwareBackend for OpaqueExitBackend {
        fn name(&self) -> &'static str {
            "opaque"
        }

        fn create_control_block(
            &self,
            vcpu_id: u32,
            walker: Arc<dyn TranslationWalker>,
        ) -> ControlBlock {
            ControlBlock::new(CbFormat::Vtx, vcpu_id, walker)
        }

        fn load(&self, cb: &mut ControlBlock, state: &VcpuState) {
            *cb.guest_mut() = state.clone();
        }

        fn save(&self, cb: &ControlBlock) -> VcpuState {
            cb.guest().clone()
        }

        fn enter(&self, _cb: &mut ControlBlock) -> Result<u64, EntryFailure> {
            Ok(0xDEAD)
        }

        fn read_exit_info(&self, _cb: &ControlBlock) -> crate::backend::ExitPayload {
            crate::backend::ExitPayload::Unknown { raw: 0xDEAD }
        }
    }

    #[test]
    fn test_unclassified_exit_is_slow_path() {
        let vm = create_vm(VmConfig::default());
        let vcpu = VirtualCpu::new(
            0,
            vm.id.0,
            Arc::new(OpaqueExitBackend),
            vm.mmu().clone(),
            HaltPollConfig::default(),
        );
        assert_eq!(run_vcpu(&vm, &vcpu), RunExit::UnknownExit { raw: 0xDEAD });
        assert!(!vcpu.is_dead(), "an unrecognized reason is not corruption");
        assert_eq!(vcpu.stats().slow_exits, 1);
        // The vCPU stays runnable and surfaces the same reason again.
        assert_eq!(run_vcpu(&vm, &vcpu), RunExit::UnknownExit { raw: 0xDEAD });
    }
}
