//! VT-x-Modeled Hardware Backend
//!
//! Control blocks use VMCS-style field identifiers, event injection uses the
//! VM-entry interruption-information format, and exits are reported with VMX
//! basic exit reasons plus the exit qualification / guest-physical-address
//! fields. The guest execution machine itself lives in
//! [`crate::backend::run_guest`]; this module supplies the encodings around
//! it.

use std::sync::Arc;

use crate::backend::{
    run_guest, CbFormat, ControlBlock, EntryFailure, ExitAux, ExitCondition, ExitPayload,
    HardwareBackend,
};
use crate::bus::IoDirection;
use crate::interrupts::EventKind;
use crate::memory::{Access, TranslationWalker};
use crate::vcpu::VcpuState;

/// VMCS field encodings (the subset this backend maintains).
pub mod field {
    pub const PIN_BASED_EXEC_CONTROLS: u32 = 0x4000;
    pub const CPU_BASED_EXEC_CONTROLS: u32 = 0x4002;
    pub const VM_ENTRY_INTR_INFO: u32 = 0x4016;
    pub const VM_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
    pub const VM_EXIT_REASON: u32 = 0x4402;
    pub const VM_EXIT_INTR_INFO: u32 = 0x4404;
    pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
    pub const EXIT_QUALIFICATION: u32 = 0x6400;
    pub const GUEST_RSP: u32 = 0x681C;
    pub const GUEST_RIP: u32 = 0x681E;
    pub const GUEST_RFLAGS: u32 = 0x6820;
}

/// VMX basic exit reasons.
pub mod exit_reason {
    pub const EXTERNAL_INTERRUPT: u64 = 1;
    pub const INTERRUPT_WINDOW: u64 = 7;
    pub const HLT: u64 = 12;
    pub const VMCALL: u64 = 18;
    pub const VMLAUNCH: u64 = 20;
    pub const IO_INSTRUCTION: u64 = 30;
    pub const EPT_VIOLATION: u64 = 48;

    /// Set in the exit-reason field when VM entry itself failed.
    pub const ENTRY_FAILURE_BIT: u64 = 1 << 31;
    /// Entry failure: invalid guest state.
    pub const FAILED_ENTRY_GUEST_STATE: u64 = 33;
}

// Primary processor-based execution control: interrupt-window exiting.
const CPU_BASED_INTR_WINDOW_EXITING: u64 = 1 << 2;

// VM-entry interruption-information layout.
const INTR_TYPE_SHIFT: u64 = 8;
const INTR_TYPE_EXTERNAL: u64 = 0;
const INTR_TYPE_NMI: u64 = 2;
const INTR_TYPE_HW_EXCEPTION: u64 = 3;
const INTR_INFO_DELIVER_ERROR_CODE: u64 = 1 << 11;
const INTR_INFO_VALID: u64 = 1 << 31;

// EPT violation exit-qualification bits (attempted access).
const EPT_QUAL_READ: u64 = 1 << 0;
const EPT_QUAL_WRITE: u64 = 1 << 1;

// I/O instruction exit-qualification layout.
const IO_QUAL_DIRECTION_IN: u64 = 1 << 3;
const IO_QUAL_REP: u64 = 1 << 5;
const IO_QUAL_PORT_SHIFT: u64 = 16;

pub(crate) fn write_event_injection(
    cb: &mut ControlBlock,
    kind: EventKind,
    vector: u8,
    error_code: Option<u32>,
) {
    let ty = match kind {
        EventKind::Interrupt => INTR_TYPE_EXTERNAL,
        EventKind::Nmi => INTR_TYPE_NMI,
        EventKind::Exception => INTR_TYPE_HW_EXCEPTION,
    };
    let mut info = INTR_INFO_VALID | (ty << INTR_TYPE_SHIFT) | vector as u64;
    if let Some(code) = error_code {
        info |= INTR_INFO_DELIVER_ERROR_CODE;
        cb.set_field(field::VM_ENTRY_EXCEPTION_ERROR_CODE, code as u64);
    }
    cb.set_field(field::VM_ENTRY_INTR_INFO, info);
}

pub(crate) fn decode_event_injection(raw: u64) -> Option<(EventKind, u8)> {
    if raw & INTR_INFO_VALID == 0 {
        return None;
    }
    let kind = match (raw >> INTR_TYPE_SHIFT) & 0x7 {
        INTR_TYPE_NMI => EventKind::Nmi,
        INTR_TYPE_HW_EXCEPTION => EventKind::Exception,
        _ => EventKind::Interrupt,
    };
    Some((kind, (raw & 0xFF) as u8))
}

pub(crate) fn arm_interrupt_window(cb: &mut ControlBlock) {
    let ctrl = cb.field(field::CPU_BASED_EXEC_CONTROLS);
    cb.set_field(field::CPU_BASED_EXEC_CONTROLS, ctrl | CPU_BASED_INTR_WINDOW_EXITING);
}

pub(crate) fn interrupt_window_armed(cb: &ControlBlock) -> bool {
    cb.field(field::CPU_BASED_EXEC_CONTROLS) & CPU_BASED_INTR_WINDOW_EXITING != 0
}

pub(crate) fn disarm_interrupt_window(cb: &mut ControlBlock) {
    let ctrl = cb.field(field::CPU_BASED_EXEC_CONTROLS);
    cb.set_field(field::CPU_BASED_EXEC_CONTROLS, ctrl & !CPU_BASED_INTR_WINDOW_EXITING);
}

/// Encode an exit condition into the VMCS exit-information fields, returning
/// the raw (basic) exit reason.
fn record_exit(cb: &mut ControlBlock, cond: ExitCondition) -> u64 {
    cb.set_aux(None);
    cb.set_field(field::GUEST_PHYSICAL_ADDRESS, 0);
    cb.set_field(field::EXIT_QUALIFICATION, 0);
    let reason = match cond {
        ExitCondition::MemoryFault { gpa, access, width, data } => {
            let mut qual = 0;
            if access.contains(Access::READ) {
                qual |= EPT_QUAL_READ;
            }
            if access.contains(Access::WRITE) {
                qual |= EPT_QUAL_WRITE;
            }
            cb.set_field(field::GUEST_PHYSICAL_ADDRESS, gpa);
            cb.set_field(field::EXIT_QUALIFICATION, qual);
            cb.set_aux(Some(ExitAux::Mmio { width, data }));
            exit_reason::EPT_VIOLATION
        }
        ExitCondition::Pio { port, width, direction, count, data } => {
            let mut qual = ((width as u64) - 1) | ((port as u64) << IO_QUAL_PORT_SHIFT);
            if direction == IoDirection::Read {
                qual |= IO_QUAL_DIRECTION_IN;
            }
            if count > 1 {
                qual |= IO_QUAL_REP;
                cb.guest_mut().regs.rcx = count as u64;
            }
            if let Some(data) = data {
                // Outgoing data travels in RAX, as on real hardware.
                cb.guest_mut().regs.rax = data;
            }
            cb.set_field(field::EXIT_QUALIFICATION, qual);
            exit_reason::IO_INSTRUCTION
        }
        ExitCondition::Hlt => exit_reason::HLT,
        ExitCondition::InterruptWindow => exit_reason::INTERRUPT_WINDOW,
        ExitCondition::Hypercall { nr, args } => {
            cb.guest_mut().regs.rax = nr;
            cb.set_aux(Some(ExitAux::Hypercall { nr, args }));
            exit_reason::VMCALL
        }
        ExitCondition::NestedEntry(desc) => {
            cb.set_aux(Some(ExitAux::Nested(desc)));
            exit_reason::VMLAUNCH
        }
    };
    cb.set_field(field::VM_EXIT_REASON, reason);
    reason
}

fn decode_exit(cb: &ControlBlock) -> ExitPayload {
    let raw = cb.field(field::VM_EXIT_REASON);
    match raw & 0xFFFF {
        exit_reason::EPT_VIOLATION => {
            let qual = cb.field(field::EXIT_QUALIFICATION);
            let mut access = Access::empty();
            if qual & EPT_QUAL_READ != 0 {
                access |= Access::READ;
            }
            if qual & EPT_QUAL_WRITE != 0 {
                access |= Access::WRITE;
            }
            let (width, data) = match cb.aux() {
                Some(ExitAux::Mmio { width, data }) => (*width, *data),
                _ => (0, None),
            };
            ExitPayload::MemoryFault {
                gpa: cb.field(field::GUEST_PHYSICAL_ADDRESS),
                access,
                width,
                data,
            }
        }
        exit_reason::IO_INSTRUCTION => {
            let qual = cb.field(field::EXIT_QUALIFICATION);
            let direction = if qual & IO_QUAL_DIRECTION_IN != 0 {
                IoDirection::Read
            } else {
                IoDirection::Write
            };
            let count = if qual & IO_QUAL_REP != 0 { cb.guest().regs.rcx as u32 } else { 1 };
            let data = match direction {
                IoDirection::Write => Some(cb.guest().regs.rax),
                IoDirection::Read => None,
            };
            ExitPayload::PioAccess {
                port: (qual >> IO_QUAL_PORT_SHIFT) as u16,
                width: ((qual & 0x7) + 1) as u8,
                direction,
                count,
                data,
            }
        }
        exit_reason::HLT => ExitPayload::Hlt,
        exit_reason::INTERRUPT_WINDOW => ExitPayload::InterruptWindow,
        exit_reason::VMCALL => match cb.aux() {
            Some(ExitAux::Hypercall { nr, args }) => {
                ExitPayload::Hypercall { nr: *nr, args: args.clone() }
            }
            _ => ExitPayload::Unknown { raw },
        },
        exit_reason::VMLAUNCH => match cb.aux() {
            Some(ExitAux::Nested(desc)) => ExitPayload::NestedEntry(desc.clone()),
            _ => ExitPayload::Unknown { raw },
        },
        _ => ExitPayload::Unknown { raw },
    }
}

/// The VT-x-modeled backend.
pub struct VtxBackend;

impl HardwareBackend for VtxBackend {
    fn name(&self) -> &'static str {
        "vtx"
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
        cb.set_field(field::GUEST_RIP, state.regs.rip);
        cb.set_field(field::GUEST_RSP, state.regs.rsp);
        cb.set_field(field::GUEST_RFLAGS, state.regs.rflags);
    }

    fn save(&self, cb: &ControlBlock) -> VcpuState {
        cb.guest().clone()
    }

    fn enter(&self, cb: &mut ControlBlock) -> Result<u64, EntryFailure> {
        match run_guest(cb) {
            Ok(cond) => Ok(record_exit(cb, cond)),
            Err(failure) => {
                cb.set_field(
                    field::VM_EXIT_REASON,
                    exit_reason::ENTRY_FAILURE_BIT | exit_reason::FAILED_ENTRY_GUEST_STATE,
                );
                Err(failure)
            }
        }
    }

    fn read_exit_info(&self, cb: &ControlBlock) -> ExitPayload {
        decode_exit(cb)
    }
}
