//! vmcore - Hardware-Assisted Virtualization Core
//!
//! A userspace virtualization core in the KVM mold: VM and vCPU objects over
//! two interchangeable hardware-extension backends (VT-x and AMD-V modeled),
//! a second-level translation engine with slot-table memory topology and
//! dirty-page tracking, an interrupt controller with window arbitration, a
//! run loop with adaptive halt polling, and a single extra level of nested
//! virtualization.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     VM Manager (registry)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  VirtualMachine                                              │
//! │  ┌──────────────┐ ┌───────────────┐ ┌─────────────────────┐ │
//! │  │  Slot Table  │ │   GuestMmu    │ │       IoBus         │ │
//! │  │  (CoW, gen)  │ │  (EPT/NPT-    │ │  (MMIO/PIO device   │ │
//! │  │              │ │   analog)     │ │   models)           │ │
//! │  └──────────────┘ └───────────────┘ └─────────────────────┘ │
//! │  VirtualCpu (per runner thread)                              │
//! │  ┌──────────────┐ ┌───────────────┐ ┌─────────────────────┐ │
//! │  │ ControlBlock │ │  Interrupt    │ │  Run loop           │ │
//! │  │ (VMCS/VMCB-  │ │  Controller   │ │  (fast/slow exits,  │ │
//! │  │  shaped)     │ │  (priorities, │ │   halt polling,     │ │
//! │  │              │ │   windows)    │ │   nested routing)   │ │
//! │  └──────────────┘ └───────────────┘ └─────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use vmcore::{create_vm, VmConfig, SlotFlags, GuestAction};
//!
//! let vm = create_vm(VmConfig::default());
//! vm.set_memory_region(0, 0x100, 0x100, 0x8000, SlotFlags::empty())?;
//! let vcpu = vm.create_vcpu()?;
//! vcpu.program_guest([GuestAction::Hypercall { nr: 1, args: vec![] }]);
//! match vm.run(0)? {
//!     vmcore::RunExit::Hypercall { nr, .. } => println!("guest called {nr}"),
//!     other => println!("exit: {other:?}"),
//! }
//! ```

// Core modules
pub mod backend;
pub mod bus;
pub mod interrupts;
pub mod memory;
pub mod nested;
pub mod runner;
pub mod vcpu;
pub mod vm;

// Hardware virtualization extensions
pub mod vmx; // Intel VT-x
pub mod svm; // AMD-V (SVM)

pub use backend::{
    CbFormat, ControlBlock, EntryFailure, ExitClass, ExitPayload, GuestAction, HardwareBackend,
};
pub use bus::{BusDevice, BusRange, BusResult, BusSpace, IoBus, IoDirection};
pub use interrupts::{EventKind, InterruptController, PendingEvent};
pub use memory::{
    Access, Gfn, GuestMmu, Hfn, MemorySlot, SlotFlags, SlotTable, TranslationFault,
    TranslationWalker, PAGE_SHIFT, PAGE_SIZE,
};
pub use nested::{NestedDescriptor, NestedState, MANDATORY_HOST_INTERCEPTS};
pub use runner::RunExit;
pub use svm::SvmBackend;
pub use vcpu::{HaltPollConfig, Registers, VcpuMode, VcpuState, VirtualCpu};
pub use vm::{
    create_vm, destroy_vm, lookup_vm, BackendKind, IrqRoute, VirtualMachine, VmConfig, VmError,
    VmId, VmResult, VmState,
};
pub use vmx::VtxBackend;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;
