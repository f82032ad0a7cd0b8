//! Virtual CPU
//!
//! Per-vCPU state: architectural registers, the hardware control block, the
//! pending-event controller, the translation-cache hint, and the adaptive
//! halt-polling machinery. A vCPU is driven by exactly one runner thread at a
//! time; cross-thread interaction is limited to queueing events, requesting
//! exits, and waking a halted vCPU.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::{ControlBlock, GuestAction, HardwareBackend};
use crate::interrupts::{InterruptController, PendingEvent};
use crate::memory::{SlotCache, TranslationWalker};
use crate::nested::{NestedState, NestedStats};

/// RFLAGS bits.
pub mod rflags {
    /// Interrupt enable flag.
    pub const IF: u64 = 1 << 9;
    /// Always-set reserved bit.
    pub const RESERVED: u64 = 1 << 1;
}

/// Architectural general-purpose register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: rflags::RESERVED,
        }
    }
}

/// Snapshot of a vCPU's architectural state. Valid to read or replace only
/// while the vCPU is outside guest mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuState {
    pub regs: Registers,
}

impl VcpuState {
    pub fn interrupts_enabled(&self) -> bool {
        self.regs.rflags & rflags::IF != 0
    }

    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        if enabled {
            self.regs.rflags |= rflags::IF;
        } else {
            self.regs.rflags &= !rflags::IF;
        }
    }
}

/// Execution mode, visible to other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcpuMode {
    /// Not between entry and exit; state may be inspected.
    Outside = 0,
    /// Between entry and exit.
    InGuest = 1,
    /// An exit has been observed and is being serviced.
    Exiting = 2,
}

impl VcpuMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InGuest,
            2 => Self::Exiting,
            _ => Self::Outside,
        }
    }
}

/// Adaptive halt-poll tuning, fixed per VM at creation.
#[derive(Debug, Clone, Copy)]
pub struct HaltPollConfig {
    pub initial_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub grow: u64,
    pub shrink: u64,
}

impl Default for HaltPollConfig {
    fn default() -> Self {
        Self {
            initial_ns: 200_000,
            min_ns: 10_000,
            max_ns: 2_000_000,
            grow: 2,
            shrink: 2,
        }
    }
}

/// Current halt-poll window, adjusted after every halt.
#[derive(Debug)]
struct HaltPollState {
    window_ns: u64,
    cfg: HaltPollConfig,
}

impl HaltPollState {
    fn new(cfg: HaltPollConfig) -> Self {
        Self { window_ns: cfg.initial_ns, cfg }
    }

    fn grow(&mut self) {
        self.window_ns = (self.window_ns * self.cfg.grow).min(self.cfg.max_ns);
    }

    fn shrink(&mut self) {
        self.window_ns = (self.window_ns / self.cfg.shrink).max(self.cfg.min_ns);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VcpuStats {
    pub entries: u64,
    pub exits: u64,
    /// Exits absorbed in the run loop without returning to the caller.
    pub fast_exits: u64,
    /// Exits surfaced to the caller as a run result.
    pub slow_exits: u64,
    pub halts: u64,
    pub polls_succeeded: u64,
    pub polls_expired: u64,
    pub kicks: u64,
    /// Exit counts indexed by [`crate::backend::ExitClass`] discriminant.
    pub exits_by_class: [u64; 7],
}

#[derive(Debug, PartialEq, Eq)]
pub enum VcpuError {
    /// State access attempted while the vCPU is between entry and exit.
    InGuest,
}

impl std::fmt::Display for VcpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InGuest => write!(f, "vcpu is in guest mode"),
        }
    }
}

pub struct VirtualCpu {
    pub id: u32,
    pub vm_id: u64,
    mode: AtomicU8,
    pub(crate) cb: Mutex<ControlBlock>,
    pub events: InterruptController,
    pub(crate) cache: Mutex<SlotCache>,
    wake_pending: Mutex<bool>,
    wake_cv: Condvar,
    halt_poll: Mutex<HaltPollState>,
    exit_requested: AtomicBool,
    dead: AtomicBool,
    diag: Mutex<Option<String>>,
    pub(crate) stats: Mutex<VcpuStats>,
    pub(crate) nested: Mutex<Option<NestedState>>,
    pub(crate) nested_stats: Mutex<NestedStats>,
    backend: Arc<dyn HardwareBackend>,
}

impl VirtualCpu {
    pub(crate) fn new(
        id: u32,
        vm_id: u64,
        backend: Arc<dyn HardwareBackend>,
        walker: Arc<dyn TranslationWalker>,
        halt_poll: HaltPollConfig,
    ) -> Self {
        let cb = backend.create_control_block(id, walker);
        Self {
            id,
            vm_id,
            mode: AtomicU8::new(VcpuMode::Outside as u8),
            cb: Mutex::new(cb),
            events: InterruptController::new(),
            cache: Mutex::new(SlotCache::new()),
            wake_pending: Mutex::new(false),
            wake_cv: Condvar::new(),
            halt_poll: Mutex::new(HaltPollState::new(halt_poll)),
            exit_requested: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            diag: Mutex::new(None),
            stats: Mutex::new(VcpuStats::default()),
            nested: Mutex::new(None),
            nested_stats: Mutex::new(NestedStats::default()),
            backend,
        }
    }

    /// Whether an L2 context is active on this vCPU.
    pub fn nested_active(&self) -> bool {
        self.nested.lock().is_some()
    }

    pub fn nested_stats(&self) -> NestedStats {
        *self.nested_stats.lock()
    }

    pub fn backend(&self) -> &Arc<dyn HardwareBackend> {
        &self.backend
    }

    pub fn mode(&self) -> VcpuMode {
        VcpuMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: VcpuMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Diagnostic recorded when the vCPU was marked dead.
    pub fn death_diagnostic(&self) -> Option<String> {
        self.diag.lock().clone()
    }

    pub(crate) fn mark_dead(&self, diag: String) {
        log::error!("vcpu {}/{}: marked dead: {}", self.vm_id, self.id, diag);
        *self.diag.lock() = Some(diag);
        self.dead.store(true, Ordering::Release);
    }

    /// Ask the runner to return to its caller at the next exit boundary.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.kick();
    }

    pub(crate) fn take_exit_request(&self) -> bool {
        self.exit_requested.swap(false, Ordering::AcqRel)
    }

    /// Queue an event for injection and wake the vCPU if it is halted.
    pub fn enqueue_event(&self, event: PendingEvent) {
        self.events.queue(event);
        self.kick();
    }

    /// Wake a halted or polling vCPU.
    pub fn kick(&self) {
        self.stats.lock().kicks += 1;
        let mut pending = self.wake_pending.lock();
        *pending = true;
        self.wake_cv.notify_one();
    }

    /// Whether the halted vCPU has a reason to resume. A maskable interrupt
    /// the guest cannot take (`guest_if` false) does not count; only an
    /// injectable event or an exit request ends the halt.
    fn has_wakeup(&self, guest_if: bool) -> bool {
        self.events.has_deliverable(guest_if) || self.exit_requested.load(Ordering::Acquire)
    }

    /// Adaptive halt: spin-poll for the current window, then block on the
    /// wake condition. The window doubles (capped) when a wakeup arrives
    /// during the poll and halves (floored) when the poll expires. The wakeup
    /// condition is checked at least once before the window can expire.
    pub(crate) fn halt_wait(&self, guest_if: bool) {
        self.stats.lock().halts += 1;

        let window = Duration::from_nanos(self.halt_poll.lock().window_ns);
        let start = Instant::now();
        loop {
            if self.has_wakeup(guest_if) {
                self.halt_poll.lock().grow();
                self.stats.lock().polls_succeeded += 1;
                return;
            }
            if start.elapsed() >= window {
                break;
            }
            std::hint::spin_loop();
        }
        self.halt_poll.lock().shrink();
        self.stats.lock().polls_expired += 1;

        let mut pending = self.wake_pending.lock();
        while !*pending && !self.has_wakeup(guest_if) {
            self.wake_cv.wait(&mut pending);
        }
        *pending = false;
    }

    pub(crate) fn halt_poll_window_ns(&self) -> u64 {
        self.halt_poll.lock().window_ns
    }

    /// Snapshot architectural state. Fails while the vCPU is in guest mode.
    pub fn get_state(&self) -> Result<VcpuState, VcpuError> {
        if self.mode() == VcpuMode::InGuest {
            return Err(VcpuError::InGuest);
        }
        let cb = self.cb.lock();
        Ok(self.backend.save(&cb))
    }

    /// Replace architectural state. Fails while the vCPU is in guest mode.
    pub fn set_state(&self, state: &VcpuState) -> Result<(), VcpuError> {
        if self.mode() == VcpuMode::InGuest {
            return Err(VcpuError::InGuest);
        }
        let mut cb = self.cb.lock();
        self.backend.load(&mut cb, state);
        Ok(())
    }

    /// Queue modeled guest work for the next entries.
    pub fn program_guest<I: IntoIterator<Item = GuestAction>>(&self, actions: I) {
        self.cb.lock().program_guest(actions);
    }

    pub fn stats(&self) -> VcpuStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMmu;
    use crate::vmx::VtxBackend;

    fn test_vcpu(halt_poll: HaltPollConfig) -> VirtualCpu {
        VirtualCpu::new(0, 1, Arc::new(VtxBackend), Arc::new(GuestMmu::new()), halt_poll)
    }

    #[test]
    fn test_state_roundtrip() {
        let vcpu = test_vcpu(HaltPollConfig::default());
        let mut state = VcpuState::default();
        state.regs.rip = 0x1000;
        state.regs.rsp = 0x8000;
        state.set_interrupts_enabled(true);
        vcpu.set_state(&state).unwrap();
        assert_eq!(vcpu.get_state().unwrap(), state);
    }

    #[test]
    fn test_state_blocked_in_guest_mode() {
        let vcpu = test_vcpu(HaltPollConfig::default());
        vcpu.set_mode(VcpuMode::InGuest);
        assert_eq!(vcpu.get_state(), Err(VcpuError::InGuest));
        assert_eq!(vcpu.set_state(&VcpuState::default()), Err(VcpuError::InGuest));
        vcpu.set_mode(VcpuMode::Outside);
        assert!(vcpu.get_state().is_ok());
    }

    #[test]
    fn test_poll_window_grows_and_shrinks_within_bounds() {
        let cfg = HaltPollConfig {
            initial_ns: 40,
            min_ns: 10,
            max_ns: 160,
            grow: 2,
            shrink: 2,
        };
        let vcpu = test_vcpu(cfg);

        // Work already pending: polls succeed, window doubles to the cap.
        vcpu.enqueue_event(PendingEvent::interrupt(0x20));
        for _ in 0..5 {
            vcpu.halt_wait(true);
        }
        assert_eq!(vcpu.halt_poll_window_ns(), cfg.max_ns);

        // Drain and let polls expire: window halves to the floor. A kick is
        // parked ahead of time so the blocking phase returns immediately.
        let mut cb = ControlBlock::new(
            crate::backend::CbFormat::Vtx,
            0,
            Arc::new(GuestMmu::new()),
        );
        cb.guest_mut().set_interrupts_enabled(true);
        vcpu.events.prepare_injection(&mut cb);
        assert!(!vcpu.events.has_pending());
        for _ in 0..6 {
            vcpu.kick();
            vcpu.halt_wait(true);
        }
        assert_eq!(vcpu.halt_poll_window_ns(), cfg.min_ns);

        let stats = vcpu.stats();
        assert_eq!(stats.polls_succeeded, 5);
        assert_eq!(stats.polls_expired, 6);
    }

    #[test]
    fn test_masked_interrupt_does_not_end_halt() {
        let cfg = HaltPollConfig {
            initial_ns: 40,
            min_ns: 10,
            max_ns: 160,
            grow: 2,
            shrink: 2,
        };
        let vcpu = test_vcpu(cfg);

        // A maskable interrupt the guest cannot take leaves the poll to
        // expire; the parked kick from enqueue lets the blocking phase
        // return. The window shrinks, it must not grow.
        vcpu.enqueue_event(PendingEvent::interrupt(0x20));
        vcpu.halt_wait(false);
        let stats = vcpu.stats();
        assert_eq!(stats.polls_succeeded, 0);
        assert_eq!(stats.polls_expired, 1);
        assert!(vcpu.halt_poll_window_ns() < cfg.initial_ns);

        // An NMI is injectable regardless of the interrupt flag.
        vcpu.enqueue_event(PendingEvent::nmi());
        vcpu.halt_wait(false);
        assert_eq!(vcpu.stats().polls_succeeded, 1);
    }

    #[test]
    fn test_wake_from_other_thread() {
        let vcpu = Arc::new(test_vcpu(HaltPollConfig {
            initial_ns: 1_000,
            min_ns: 1_000,
            max_ns: 1_000,
            grow: 2,
            shrink: 2,
        }));
        let waker = vcpu.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.enqueue_event(PendingEvent::nmi());
        });
        vcpu.halt_wait(false);
        handle.join().unwrap();
        assert!(vcpu.events.has_pending());
    }
}
