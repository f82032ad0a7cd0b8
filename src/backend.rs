//! Hardware Backend Abstraction
//!
//! A capability interface implemented once per supported virtualization
//! extension. Two interchangeable backends exist: a VT-x-modeled one
//! ([`crate::vmx::VtxBackend`]) and an AMD-V-modeled one
//! ([`crate::svm::SvmBackend`]). Each owns its control-block field encodings,
//! raw exit codes, and event-injection format; the guest execution machine
//! itself is shared.
//!
//! `enter` is the only operation that transfers control to guest execution.
//! Guest work is modeled as a per-control-block action queue (no instruction
//! emulation): a memory access retires only when the hardware walk resolves it
//! with sufficient permissions, otherwise the vCPU exits with the access left
//! pending so that fault resolution plus re-entry retires it without a further
//! exit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::bus::IoDirection;
use crate::interrupts::EventKind;
use crate::memory::{Access, Gfn, TranslationWalker, PAGE_SHIFT};
use crate::nested::NestedDescriptor;
use crate::vcpu::VcpuState;

/// Control-block layout family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbFormat {
    /// VMCS-style field identifiers, VMX exit reasons, intr-info injection.
    Vtx,
    /// VMCB-style offsets, SVM exit codes, EVENTINJ injection.
    Svm,
}

/// Common classification of an exit condition, independent of the backend's
/// raw code for it. Also the bit vocabulary for intercept sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    MemoryFault,
    PortIo,
    Hlt,
    InterruptWindow,
    Hypercall,
    NestedEntry,
    Unknown,
}

impl ExitClass {
    pub const fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

/// One unit of modeled guest work.
#[derive(Debug, Clone)]
pub enum GuestAction {
    MemRead { gpa: u64, width: u8 },
    MemWrite { gpa: u64, width: u8, data: u64 },
    PortIn { port: u16, width: u8 },
    PortOut { port: u16, width: u8, data: u64, count: u32 },
    SetInterruptFlag(bool),
    Halt,
    Hypercall { nr: u64, args: Vec<u64> },
    NestedEnter(NestedDescriptor),
}

/// Decoded reason-specific exit information, produced by `read_exit_info`.
#[derive(Debug, Clone)]
pub enum ExitPayload {
    MemoryFault { gpa: u64, access: Access, width: u8, data: Option<u64> },
    PioAccess { port: u16, width: u8, direction: IoDirection, count: u32, data: Option<u64> },
    Hlt,
    InterruptWindow,
    Hypercall { nr: u64, args: Vec<u64> },
    NestedEntry(NestedDescriptor),
    Unknown { raw: u64 },
}

impl ExitPayload {
    pub fn class(&self) -> ExitClass {
        match self {
            Self::MemoryFault { .. } => ExitClass::MemoryFault,
            Self::PioAccess { .. } => ExitClass::PortIo,
            Self::Hlt => ExitClass::Hlt,
            Self::InterruptWindow => ExitClass::InterruptWindow,
            Self::Hypercall { .. } => ExitClass::Hypercall,
            Self::NestedEntry(_) => ExitClass::NestedEntry,
            Self::Unknown { .. } => ExitClass::Unknown,
        }
    }
}

/// Exit condition raised by the guest machine, before the backend encodes it
/// into its exit-information fields.
#[derive(Debug, Clone)]
pub(crate) enum ExitCondition {
    MemoryFault { gpa: u64, access: Access, width: u8, data: Option<u64> },
    Pio { port: u16, width: u8, direction: IoDirection, count: u32, data: Option<u64> },
    Hlt,
    InterruptWindow,
    Hypercall { nr: u64, args: Vec<u64> },
    NestedEntry(NestedDescriptor),
}

/// Payload data the hardware-shaped fields cannot carry (immediate MMIO bytes,
/// hypercall argument lists, nested control-block descriptions).
#[derive(Debug, Clone)]
pub(crate) enum ExitAux {
    Mmio { width: u8, data: Option<u64> },
    Hypercall { nr: u64, args: Vec<u64> },
    Nested(NestedDescriptor),
}

/// Hardware entry failure: invalid control-block state. Fatal to the owning
/// vCPU; surfaced as a diagnostic run result and never retried silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub code: u32,
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hardware entry failure (diagnostic code {})", self.code)
    }
}

/// Entry-failure diagnostic codes.
pub mod entry_diag {
    /// Guest state failed the consistency checks on entry.
    pub const INVALID_GUEST_STATE: u32 = 0x21;
    /// Control fields are mutually inconsistent.
    pub const INVALID_CONTROL_STATE: u32 = 0x07;
}

/// An event recorded as accepted by the guest. Kept for the injection-visible
/// history the interrupt controller and tests inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredEvent {
    pub kind: EventKind,
    pub vector: u8,
}

/// The per-vCPU hardware control block: guest register state plus
/// execution-control fields in the backend's own encoding. Exclusively owned
/// by one vCPU and never touched by another thread while that vCPU is in
/// guest mode.
pub struct ControlBlock {
    pub vcpu_id: u32,
    format: CbFormat,
    fields: HashMap<u32, u64>,
    guest: VcpuState,
    program: VecDeque<GuestAction>,
    walker: Arc<dyn TranslationWalker>,
    pub launched: bool,
    poisoned: Option<u32>,
    aux: Option<ExitAux>,
    delivered: Vec<DeliveredEvent>,
}

impl ControlBlock {
    pub(crate) fn new(format: CbFormat, vcpu_id: u32, walker: Arc<dyn TranslationWalker>) -> Self {
        Self {
            vcpu_id,
            format,
            fields: HashMap::new(),
            guest: VcpuState::default(),
            program: VecDeque::new(),
            walker,
            launched: false,
            poisoned: None,
            aux: None,
            delivered: Vec::new(),
        }
    }

    pub fn format(&self) -> CbFormat {
        self.format
    }

    pub fn field(&self, id: u32) -> u64 {
        self.fields.get(&id).copied().unwrap_or(0)
    }

    pub fn set_field(&mut self, id: u32, value: u64) {
        self.fields.insert(id, value);
    }

    pub fn guest(&self) -> &VcpuState {
        &self.guest
    }

    pub fn guest_mut(&mut self) -> &mut VcpuState {
        &mut self.guest
    }

    /// The guest's interrupt-enable flag.
    pub fn guest_if(&self) -> bool {
        self.guest.interrupts_enabled()
    }

    /// Queue modeled guest work onto this control block.
    pub fn push_action(&mut self, action: GuestAction) {
        self.program.push_back(action);
    }

    pub fn program_guest<I: IntoIterator<Item = GuestAction>>(&mut self, actions: I) {
        self.program.extend(actions);
    }

    pub fn program_len(&self) -> usize {
        self.program.len()
    }

    /// Retire the front action without executing it. Used after an MMIO-shaped
    /// access has been completed by the I/O bus or the external manager.
    pub(crate) fn retire_front_action(&mut self) {
        self.program.pop_front();
    }

    /// Mark the guest state invalid so the next entry fails with `code`.
    pub fn poison(&mut self, code: u32) {
        self.poisoned = Some(code);
    }

    // Event injection. Encoding dispatches on the control-block format; the
    // valid bit (bit 31) is shared by both layouts.

    fn injection_field(&self) -> u32 {
        match self.format {
            CbFormat::Vtx => crate::vmx::field::VM_ENTRY_INTR_INFO,
            CbFormat::Svm => crate::svm::offset::EVENTINJ,
        }
    }

    pub fn has_pending_injection(&self) -> bool {
        self.field(self.injection_field()) & (1 << 31) != 0
    }

    pub fn inject_event(&mut self, kind: EventKind, vector: u8, error_code: Option<u32>) {
        match self.format {
            CbFormat::Vtx => crate::vmx::write_event_injection(self, kind, vector, error_code),
            CbFormat::Svm => crate::svm::write_event_injection(self, kind, vector, error_code),
        }
    }

    pub(crate) fn take_event_injection(&mut self) -> Option<(EventKind, u8)> {
        let id = self.injection_field();
        let raw = self.field(id);
        if raw & (1 << 31) == 0 {
            return None;
        }
        self.set_field(id, 0);
        match self.format {
            CbFormat::Vtx => crate::vmx::decode_event_injection(raw),
            CbFormat::Svm => crate::svm::decode_event_injection(raw),
        }
    }

    // Interrupt-window arbitration: arm a trap that fires as soon as the
    // guest re-enables interrupts.

    pub fn request_interrupt_window(&mut self) {
        match self.format {
            CbFormat::Vtx => crate::vmx::arm_interrupt_window(self),
            CbFormat::Svm => crate::svm::arm_interrupt_window(self),
        }
    }

    pub fn interrupt_window_armed(&self) -> bool {
        match self.format {
            CbFormat::Vtx => crate::vmx::interrupt_window_armed(self),
            CbFormat::Svm => crate::svm::interrupt_window_armed(self),
        }
    }

    fn disarm_interrupt_window(&mut self) {
        match self.format {
            CbFormat::Vtx => crate::vmx::disarm_interrupt_window(self),
            CbFormat::Svm => crate::svm::disarm_interrupt_window(self),
        }
    }

    pub(crate) fn set_aux(&mut self, aux: Option<ExitAux>) {
        self.aux = aux;
    }

    pub(crate) fn aux(&self) -> Option<&ExitAux> {
        self.aux.as_ref()
    }

    /// Events the guest has accepted, in delivery order.
    pub fn delivered_events(&self) -> &[DeliveredEvent] {
        &self.delivered
    }
}

/// Run modeled guest work until the next exit condition.
///
/// Order per entry: fail poisoned state, consume a valid injection field
/// (delivering the event), honor an armed interrupt window once the guest's
/// interrupt flag is set, then retire actions until one forces an exit. An
/// empty program behaves as a halted guest.
pub(crate) fn run_guest(cb: &mut ControlBlock) -> Result<ExitCondition, EntryFailure> {
    if let Some(code) = cb.poisoned {
        return Err(EntryFailure { code });
    }
    cb.launched = true;

    if let Some((kind, vector)) = cb.take_event_injection() {
        cb.delivered.push(DeliveredEvent { kind, vector });
        if kind == EventKind::Interrupt {
            // Interrupt delivery clears the guest's interrupt flag.
            cb.guest.set_interrupts_enabled(false);
        }
    }

    loop {
        if cb.interrupt_window_armed() && cb.guest_if() {
            cb.disarm_interrupt_window();
            return Ok(ExitCondition::InterruptWindow);
        }

        let action = match cb.program.front() {
            Some(action) => action.clone(),
            None => return Ok(ExitCondition::Hlt),
        };

        match action {
            GuestAction::MemRead { gpa, width } => {
                let gfn: Gfn = gpa >> PAGE_SHIFT;
                if cb.walker.resolve(gfn, Access::READ).is_some() {
                    cb.program.pop_front();
                } else {
                    return Ok(ExitCondition::MemoryFault {
                        gpa,
                        access: Access::READ,
                        width,
                        data: None,
                    });
                }
            }
            GuestAction::MemWrite { gpa, width, data } => {
                let gfn: Gfn = gpa >> PAGE_SHIFT;
                if cb.walker.resolve(gfn, Access::WRITE).is_some() {
                    cb.program.pop_front();
                } else {
                    return Ok(ExitCondition::MemoryFault {
                        gpa,
                        access: Access::WRITE,
                        width,
                        data: Some(data),
                    });
                }
            }
            GuestAction::PortIn { port, width } => {
                cb.program.pop_front();
                return Ok(ExitCondition::Pio {
                    port,
                    width,
                    direction: IoDirection::Read,
                    count: 1,
                    data: None,
                });
            }
            GuestAction::PortOut { port, width, data, count } => {
                cb.program.pop_front();
                return Ok(ExitCondition::Pio {
                    port,
                    width,
                    direction: IoDirection::Write,
                    count,
                    data: Some(data),
                });
            }
            GuestAction::SetInterruptFlag(enabled) => {
                cb.program.pop_front();
                cb.guest.set_interrupts_enabled(enabled);
            }
            GuestAction::Halt => {
                cb.program.pop_front();
                return Ok(ExitCondition::Hlt);
            }
            GuestAction::Hypercall { nr, args } => {
                cb.program.pop_front();
                return Ok(ExitCondition::Hypercall { nr, args });
            }
            GuestAction::NestedEnter(desc) => {
                cb.program.pop_front();
                return Ok(ExitCondition::NestedEntry(desc));
            }
        }
    }
}

/// The four-operation backend capability interface. Selected once at VM
/// creation based on detected host capability, never per call.
pub trait HardwareBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate the per-vCPU control block, wired to the VM's hardware-walk
    /// view of the translation table.
    fn create_control_block(
        &self,
        vcpu_id: u32,
        walker: Arc<dyn TranslationWalker>,
    ) -> ControlBlock;

    /// Load architectural register state into the control block.
    fn load(&self, cb: &mut ControlBlock, state: &VcpuState);

    /// Save architectural register state out of the control block.
    fn save(&self, cb: &ControlBlock) -> VcpuState;

    /// Enter guest mode and run until the next exit condition, returning the
    /// raw backend-specific exit reason. Must be called with the owning vCPU
    /// in guest mode and never concurrently for the same vCPU.
    fn enter(&self, cb: &mut ControlBlock) -> Result<u64, EntryFailure>;

    /// Decode the control block's exit-information fields.
    fn read_exit_info(&self, cb: &ControlBlock) -> ExitPayload;
}
