//! AMD-V-Modeled Hardware Backend
//!
//! Control blocks use VMCB-style byte offsets as field identifiers, event
//! injection uses the EVENTINJ format (error code packed in bits 63:32), and
//! exits are reported through EXITCODE / EXITINFO1 / EXITINFO2. Pending
//! virtual interrupts are requested through the VINTR field's V_IRQ bit. The
//! shared guest machine is [`crate::backend::run_guest`].

use std::sync::Arc;

use crate::backend::{
    run_guest, CbFormat, ControlBlock, EntryFailure, ExitAux, ExitCondition, ExitPayload,
    HardwareBackend,
};
use crate::bus::IoDirection;
use crate::interrupts::EventKind;
use crate::memory::{Access, TranslationWalker};
use crate::vcpu::VcpuState;

/// VMCB field offsets (the subset this backend maintains).
pub mod offset {
    pub const VINTR: u32 = 0x60;
    pub const EXITCODE: u32 = 0x70;
    pub const EXITINFO1: u32 = 0x78;
    pub const EXITINFO2: u32 = 0x80;
    pub const EXITINTINFO: u32 = 0x88;
    pub const EVENTINJ: u32 = 0xA8;
    pub const GUEST_RIP: u32 = 0x578;
    pub const GUEST_RSP: u32 = 0x5D8;
    pub const GUEST_RFLAGS: u32 = 0x570;
}

/// SVM exit codes.
pub mod exit_code {
    pub const VMEXIT_INTR: u64 = 0x60;
    pub const VMEXIT_VINTR: u64 = 0x64;
    pub const VMEXIT_HLT: u64 = 0x78;
    pub const VMEXIT_IOIO: u64 = 0x7B;
    pub const VMEXIT_VMRUN: u64 = 0x80;
    pub const VMEXIT_VMMCALL: u64 = 0x81;
    pub const VMEXIT_NPF: u64 = 0x400;

    /// Entry failed consistency checks.
    pub const VMEXIT_INVALID: u64 = u64::MAX;
}

// VINTR: request a virtual interrupt intercept once the guest can take it.
const VINTR_V_IRQ: u64 = 1 << 8;

// EVENTINJ layout.
const EVENTINJ_TYPE_SHIFT: u64 = 8;
const EVENTINJ_TYPE_INTR: u64 = 0;
const EVENTINJ_TYPE_NMI: u64 = 2;
const EVENTINJ_TYPE_EXCEPTION: u64 = 3;
const EVENTINJ_EV: u64 = 1 << 11;
const EVENTINJ_VALID: u64 = 1 << 31;
const EVENTINJ_ERRCODE_SHIFT: u64 = 32;

// IOIO EXITINFO1 layout.
const IOIO_TYPE_IN: u64 = 1 << 0;
const IOIO_REP: u64 = 1 << 3;
const IOIO_SZ_SHIFT: u64 = 4;
const IOIO_PORT_SHIFT: u64 = 16;

// NPF EXITINFO1 error-code bits.
const NPF_ERR_WRITE: u64 = 1 << 1;

pub(crate) fn write_event_injection(
    cb: &mut ControlBlock,
    kind: EventKind,
    vector: u8,
    error_code: Option<u32>,
) {
    let ty = match kind {
        EventKind::Interrupt => EVENTINJ_TYPE_INTR,
        EventKind::Nmi => EVENTINJ_TYPE_NMI,
        EventKind::Exception => EVENTINJ_TYPE_EXCEPTION,
    };
    let mut inj = EVENTINJ_VALID | (ty << EVENTINJ_TYPE_SHIFT) | vector as u64;
    if let Some(code) = error_code {
        inj |= EVENTINJ_EV | ((code as u64) << EVENTINJ_ERRCODE_SHIFT);
    }
    cb.set_field(offset::EVENTINJ, inj);
}

pub(crate) fn decode_event_injection(raw: u64) -> Option<(EventKind, u8)> {
    if raw & EVENTINJ_VALID == 0 {
        return None;
    }
    let kind = match (raw >> EVENTINJ_TYPE_SHIFT) & 0x7 {
        EVENTINJ_TYPE_NMI => EventKind::Nmi,
        EVENTINJ_TYPE_EXCEPTION => EventKind::Exception,
        _ => EventKind::Interrupt,
    };
    Some((kind, (raw & 0xFF) as u8))
}

pub(crate) fn arm_interrupt_window(cb: &mut ControlBlock) {
    let vintr = cb.field(offset::VINTR);
    cb.set_field(offset::VINTR, vintr | VINTR_V_IRQ);
}

pub(crate) fn interrupt_window_armed(cb: &ControlBlock) -> bool {
    cb.field(offset::VINTR) & VINTR_V_IRQ != 0
}

pub(crate) fn disarm_interrupt_window(cb: &mut ControlBlock) {
    let vintr = cb.field(offset::VINTR);
    cb.set_field(offset::VINTR, vintr & !VINTR_V_IRQ);
}

/// Encode an exit condition into EXITCODE / EXITINFO1 / EXITINFO2.
fn record_exit(cb: &mut ControlBlock, cond: ExitCondition) -> u64 {
    cb.set_aux(None);
    cb.set_field(offset::EXITINFO1, 0);
    cb.set_field(offset::EXITINFO2, 0);
    let code = match cond {
        ExitCondition::MemoryFault { gpa, access, width, data } => {
            let mut err = 0;
            if access.contains(Access::WRITE) {
                err |= NPF_ERR_WRITE;
            }
            cb.set_field(offset::EXITINFO1, err);
            cb.set_field(offset::EXITINFO2, gpa);
            cb.set_aux(Some(ExitAux::Mmio { width, data }));
            exit_code::VMEXIT_NPF
        }
        ExitCondition::Pio { port, width, direction, count, data } => {
            let mut info = ((port as u64) << IOIO_PORT_SHIFT) | ((width as u64) << IOIO_SZ_SHIFT);
            if direction == IoDirection::Read {
                info |= IOIO_TYPE_IN;
            }
            if count > 1 {
                info |= IOIO_REP;
                cb.guest_mut().regs.rcx = count as u64;
            }
            if let Some(data) = data {
                cb.guest_mut().regs.rax = data;
            }
            cb.set_field(offset::EXITINFO1, info);
            exit_code::VMEXIT_IOIO
        }
        ExitCondition::Hlt => exit_code::VMEXIT_HLT,
        ExitCondition::InterruptWindow => exit_code::VMEXIT_VINTR,
        ExitCondition::Hypercall { nr, args } => {
            cb.guest_mut().regs.rax = nr;
            cb.set_aux(Some(ExitAux::Hypercall { nr, args }));
            exit_code::VMEXIT_VMMCALL
        }
        ExitCondition::NestedEntry(desc) => {
            cb.set_aux(Some(ExitAux::Nested(desc)));
            exit_code::VMEXIT_VMRUN
        }
    };
    cb.set_field(offset::EXITCODE, code);
    code
}

fn decode_exit(cb: &ControlBlock) -> ExitPayload {
    let raw = cb.field(offset::EXITCODE);
    match raw {
        exit_code::VMEXIT_NPF => {
            let err = cb.field(offset::EXITINFO1);
            let access = if err & NPF_ERR_WRITE != 0 { Access::WRITE } else { Access::READ };
            let (width, data) = match cb.aux() {
                Some(ExitAux::Mmio { width, data }) => (*width, *data),
                _ => (0, None),
            };
            ExitPayload::MemoryFault { gpa: cb.field(offset::EXITINFO2), access, width, data }
        }
        exit_code::VMEXIT_IOIO => {
            let info = cb.field(offset::EXITINFO1);
            let direction =
                if info & IOIO_TYPE_IN != 0 { IoDirection::Read } else { IoDirection::Write };
            let count = if info & IOIO_REP != 0 { cb.guest().regs.rcx as u32 } else { 1 };
            let data = match direction {
                IoDirection::Write => Some(cb.guest().regs.rax),
                IoDirection::Read => None,
            };
            ExitPayload::PioAccess {
                port: (info >> IOIO_PORT_SHIFT) as u16,
                width: ((info >> IOIO_SZ_SHIFT) & 0x7) as u8,
                direction,
                count,
                data,
            }
        }
        exit_code::VMEXIT_HLT => ExitPayload::Hlt,
        exit_code::VMEXIT_VINTR => ExitPayload::InterruptWindow,
        exit_code::VMEXIT_VMMCALL => match cb.aux() {
            Some(ExitAux::Hypercall { nr, args }) => {
                ExitPayload::Hypercall { nr: *nr, args: args.clone() }
            }
            _ => ExitPayload::Unknown { raw },
        },
        exit_code::VMEXIT_VMRUN => match cb.aux() {
            Some(ExitAux::Nested(desc)) => ExitPayload::NestedEntry(desc.clone()),
            _ => ExitPayload::Unknown { raw },
        },
        _ => ExitPayload::Unknown { raw },
    }
}

/// The AMD-V-modeled backend.
pub struct SvmBackend;

impl HardwareBackend for SvmBackend {
    fn name(&self) -> &'static str {
        "svm"
    }

    fn create_control_block(
        &self,
        vcpu_id: u32,
        walker: Arc<dyn TranslationWalker>,
    ) -> ControlBlock {
        ControlBlock::new(CbFormat::Svm, vcpu_id, walker)
    }

    fn load(&self, cb: &mut ControlBlock, state: &VcpuState) {
        *cb.guest_mut() = state.clone();
        cb.set_field(offset::GUEST_RIP, state.regs.rip);
        cb.set_field(offset::GUEST_RSP, state.regs.rsp);
        cb.set_field(offset::GUEST_RFLAGS, state.regs.rflags);
    }

    fn save(&self, cb: &ControlBlock) -> VcpuState {
        cb.guest().clone()
    }

    fn enter(&self, cb: &mut ControlBlock) -> Result<u64, EntryFailure> {
        match run_guest(cb) {
            Ok(cond) => Ok(record_exit(cb, cond)),
            Err(failure) => {
                cb.set_field(offset::EXITCODE, exit_code::VMEXIT_INVALID);
                Err(failure)
            }
        }
    }

    fn read_exit_info(&self, cb: &ControlBlock) -> ExitPayload {
        decode_exit(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GuestAction;
    use crate::memory::GuestMmu;

    fn backend_and_cb() -> (SvmBackend, ControlBlock) {
        let backend = SvmBackend;
        let cb = backend.create_control_block(0, Arc::new(GuestMmu::new()));
        (backend, cb)
    }

    #[test]
    fn test_npf_encoding() {
        let (backend, mut cb) = backend_and_cb();
        cb.push_action(GuestAction::MemRead { gpa: 0xC000_0000, width: 8 });
        let code = backend.enter(&mut cb).unwrap();
        assert_eq!(code, exit_code::VMEXIT_NPF);
        assert_eq!(cb.field(offset::EXITINFO2), 0xC000_0000);
        assert_eq!(cb.field(offset::EXITINFO1) & NPF_ERR_WRITE, 0);
        match backend.read_exit_info(&cb) {
            ExitPayload::MemoryFault { gpa, access, width, data } => {
                assert_eq!(gpa, 0xC000_0000);
                assert_eq!(access, Access::READ);
                assert_eq!(width, 8);
                assert_eq!(data, None);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_ioio_encoding() {
        let (backend, mut cb) = backend_and_cb();
        cb.push_action(GuestAction::PortIn { port: 0x60, width: 1 });
        let code = backend.enter(&mut cb).unwrap();
        assert_eq!(code, exit_code::VMEXIT_IOIO);
        match backend.read_exit_info(&cb) {
            ExitPayload::PioAccess { port, width, direction, count, data } => {
                assert_eq!(port, 0x60);
                assert_eq!(width, 1);
                assert_eq!(direction, IoDirection::Read);
                assert_eq!(count, 1);
                assert_eq!(data, None);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_eventinj_packs_error_code() {
        let (_backend, mut cb) = backend_and_cb();
        cb.inject_event(EventKind::Exception, 13, Some(0x10));
        let inj = cb.field(offset::EVENTINJ);
        assert_ne!(inj & EVENTINJ_VALID, 0);
        assert_ne!(inj & EVENTINJ_EV, 0);
        assert_eq!(inj >> EVENTINJ_ERRCODE_SHIFT, 0x10);
        assert_eq!(decode_event_injection(inj), Some((EventKind::Exception, 13)));
    }

    #[test]
    fn test_invalid_entry_sets_exitcode() {
        let (backend, mut cb) = backend_and_cb();
        cb.poison(crate::backend::entry_diag::INVALID_CONTROL_STATE);
        assert!(backend.enter(&mut cb).is_err());
        assert_eq!(cb.field(offset::EXITCODE), exit_code::VMEXIT_INVALID);
    }
}
