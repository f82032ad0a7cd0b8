//! I/O Bus
//!
//! Trait-based dispatch of MMIO and port I/O exits to in-process device
//! models. Devices register address ranges in a space (MMIO or PIO); an exit
//! that no registered range covers is unhandled and gets surfaced to the
//! external manager instead.

use std::sync::Arc;

use parking_lot::RwLock;

/// Which address space an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusSpace {
    Mmio,
    Pio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A half-open address range `[base, base + len)` in one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusRange {
    pub space: BusSpace,
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    pub fn mmio(base: u64, len: u64) -> Self {
        Self { space: BusSpace::Mmio, base, len }
    }

    pub fn pio(base: u16, len: u16) -> Self {
        Self { space: BusSpace::Pio, base: base as u64, len: len as u64 }
    }

    pub fn contains(&self, space: BusSpace, addr: u64) -> bool {
        self.space == space && addr >= self.base && addr - self.base < self.len
    }

    pub fn overlaps(&self, other: &BusRange) -> bool {
        self.space == other.space && self.base < other.base + other.len && other.base < self.base + self.len
    }
}

/// An emulated device model. Addresses arrive relative to the guest address,
/// not the range base. Devices are shared across vCPU threads.
pub trait BusDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Read `width` bytes at `addr`. `None` means the device declines and the
    /// access falls through to the external manager.
    fn read(&self, addr: u64, width: u8) -> Option<u64> {
        let _ = (addr, width);
        None
    }

    /// Write `width` bytes at `addr`. Returning false declines the access.
    fn write(&self, addr: u64, width: u8, data: u64) -> bool {
        let _ = (addr, width, data);
        false
    }
}

/// Outcome of a bus dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusResult {
    /// Completed in-process; `Some` carries read data.
    Handled(Option<u64>),
    /// No device claimed the access.
    Unhandled,
}

#[derive(Debug)]
pub enum BusError {
    Overlap { name: String },
    RangeWraps { base: u64, len: u64 },
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overlap { name } => {
                write!(f, "device range overlaps an existing registration: {}", name)
            }
            Self::RangeWraps { base, len } => {
                write!(f, "device range {:#x}+{:#x} wraps the address space", base, len)
            }
        }
    }
}

impl std::error::Error for BusError {}

/// Registered device ranges, first registration wins on lookup order but
/// overlapping registrations are rejected outright.
#[derive(Default)]
pub struct IoBus {
    entries: RwLock<Vec<(BusRange, Arc<dyn BusDevice>)>>,
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, range: BusRange, device: Arc<dyn BusDevice>) -> Result<(), BusError> {
        if range.base.checked_add(range.len).is_none() {
            return Err(BusError::RangeWraps { base: range.base, len: range.len });
        }
        let mut entries = self.entries.write();
        if let Some((_, existing)) = entries.iter().find(|(r, _)| r.overlaps(&range)) {
            return Err(BusError::Overlap { name: existing.name().to_string() });
        }
        log::debug!(
            "bus: registering {} at {:?} {:#x}+{:#x}",
            device.name(),
            range.space,
            range.base,
            range.len
        );
        entries.push((range, device));
        Ok(())
    }

    fn lookup(&self, space: BusSpace, addr: u64) -> Option<(u64, Arc<dyn BusDevice>)> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|(r, _)| r.contains(space, addr))
            .map(|(r, d)| (addr - r.base, d.clone()))
    }

    pub fn read(&self, space: BusSpace, addr: u64, width: u8) -> BusResult {
        match self.lookup(space, addr) {
            Some((offset, device)) => match device.read(offset, width) {
                Some(data) => BusResult::Handled(Some(data)),
                None => BusResult::Unhandled,
            },
            None => BusResult::Unhandled,
        }
    }

    pub fn write(&self, space: BusSpace, addr: u64, width: u8, data: u64) -> BusResult {
        match self.lookup(space, addr) {
            Some((offset, device)) => {
                if device.write(offset, width, data) {
                    BusResult::Handled(None)
                } else {
                    BusResult::Unhandled
                }
            }
            None => BusResult::Unhandled,
        }
    }
}
