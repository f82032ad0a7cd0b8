//! Guest Memory Translation Engine
//!
//! Owns the guest-physical address space of a VM:
//! - the memory slot table (guest-frame ranges backed by host frames)
//! - the two-level guest-physical -> host-physical translation table
//! - fault resolution for translation-type VM exits
//! - dirty-frame tracking (bitmap or ring, per slot)
//!
//! The slot table is copy-on-write: updates publish a whole new table under a
//! bumped generation, so a concurrent reader never observes a torn slot. The
//! translation table is guarded by a single VM-wide lock for structural
//! changes; vCPUs keep a generation-tagged last-used-slot hint that is
//! revalidated before reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Guest frame number (guest-physical address >> PAGE_SHIFT).
pub type Gfn = u64;
/// Host frame number.
pub type Hfn = u64;

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u64 = 12;

/// Frames covered by one leaf of the two-level translation table.
const LEAF_SPAN: u64 = 512;

bitflags::bitflags! {
    /// Memory slot flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Guest writes to this slot are denied.
        const READ_ONLY  = 1 << 0;
        /// Writes are recorded in the slot's dirty log.
        const DIRTY_LOG  = 1 << 1;
        /// Private/encrypted backing; contents opaque to the host.
        const PRIVATE    = 1 << 2;
        /// Use a dirty ring instead of a bitmap for DIRTY_LOG.
        const DIRTY_RING = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Guest access type for a translation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// Dirty-frame log attached to a DIRTY_LOG slot.
///
/// Offsets are frame offsets from the slot base. Marking is idempotent for
/// the bitmap and at-most-once per write episode for the ring (the caller only
/// marks on a write-protect fault, and the frame stays unprotected until the
/// log is harvested).
enum DirtyLog {
    Bitmap(Mutex<Vec<u64>>),
    Ring(Mutex<Vec<u64>>),
}

impl DirtyLog {
    fn new(frames: u64, ring: bool) -> Self {
        if ring {
            DirtyLog::Ring(Mutex::new(Vec::new()))
        } else {
            let words = ((frames + 63) / 64) as usize;
            DirtyLog::Bitmap(Mutex::new(vec![0u64; words]))
        }
    }

    fn mark(&self, offset: u64) {
        match self {
            DirtyLog::Bitmap(words) => {
                let mut words = words.lock();
                words[(offset / 64) as usize] |= 1u64 << (offset % 64);
            }
            DirtyLog::Ring(ring) => ring.lock().push(offset),
        }
    }

    fn collect_and_clear(&self) -> Vec<u64> {
        match self {
            DirtyLog::Bitmap(words) => {
                let mut words = words.lock();
                let mut out = Vec::new();
                for (i, word) in words.iter_mut().enumerate() {
                    let mut w = *word;
                    while w != 0 {
                        let bit = w.trailing_zeros() as u64;
                        out.push(i as u64 * 64 + bit);
                        w &= w - 1;
                    }
                    *word = 0;
                }
                out
            }
            DirtyLog::Ring(ring) => {
                let mut ring = ring.lock();
                let mut out: Vec<u64> = ring.drain(..).collect();
                out.sort_unstable();
                out.dedup();
                out
            }
        }
    }
}

/// One published memory slot: a contiguous guest-frame range backed by a
/// contiguous host-frame range. Immutable once published; slot-table updates
/// replace the whole table instead of editing a slot in place.
pub struct MemorySlot {
    pub id: u32,
    pub base_gfn: Gfn,
    pub frames: u64,
    pub host_base: Hfn,
    pub flags: SlotFlags,
    dirty: Option<DirtyLog>,
}

impl MemorySlot {
    pub fn new(id: u32, base_gfn: Gfn, frames: u64, host_base: Hfn, flags: SlotFlags) -> Self {
        let dirty = if flags.contains(SlotFlags::DIRTY_LOG) {
            Some(DirtyLog::new(frames, flags.contains(SlotFlags::DIRTY_RING)))
        } else {
            None
        };
        Self { id, base_gfn, frames, host_base, flags, dirty }
    }

    /// One past the last guest frame of the slot.
    pub fn end_gfn(&self) -> Gfn {
        self.base_gfn + self.frames
    }

    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn < self.end_gfn()
    }

    pub fn overlaps(&self, base: Gfn, frames: u64) -> bool {
        self.base_gfn < base + frames && base < self.end_gfn()
    }

    /// Host frame backing `gfn`. Caller must have checked `contains`.
    pub fn host_frame(&self, gfn: Gfn) -> Hfn {
        self.host_base + (gfn - self.base_gfn)
    }

    /// Whether the slot's flags permit `access`.
    pub fn allows(&self, access: Access) -> bool {
        !(access.contains(Access::WRITE) && self.flags.contains(SlotFlags::READ_ONLY))
    }

    /// Maximum permissions a mapping in this slot may carry.
    pub fn max_perms(&self) -> Access {
        if self.flags.contains(SlotFlags::READ_ONLY) {
            Access::READ | Access::EXEC
        } else {
            Access::READ | Access::WRITE | Access::EXEC
        }
    }

    pub fn dirty_logged(&self) -> bool {
        self.dirty.is_some()
    }

    fn mark_dirty(&self, gfn: Gfn) {
        if let Some(log) = &self.dirty {
            log.mark(gfn - self.base_gfn);
        }
    }

    fn collect_dirty(&self) -> Vec<Gfn> {
        match &self.dirty {
            Some(log) => log
                .collect_and_clear()
                .into_iter()
                .map(|off| self.base_gfn + off)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A published snapshot of the slot table, tagged with the generation it was
/// built under. Slots are kept sorted by base frame for O(log n) lookup.
pub struct SlotTable {
    pub generation: u64,
    slots: Vec<Arc<MemorySlot>>,
}

impl SlotTable {
    pub fn empty() -> Self {
        Self { generation: 0, slots: Vec::new() }
    }

    pub fn new(generation: u64, mut slots: Vec<Arc<MemorySlot>>) -> Self {
        slots.sort_by_key(|s| s.base_gfn);
        Self { generation, slots }
    }

    pub fn slots(&self) -> &[Arc<MemorySlot>] {
        &self.slots
    }

    /// Find the slot owning `gfn`, by binary search over base frames.
    pub fn find(&self, gfn: Gfn) -> Option<&Arc<MemorySlot>> {
        let idx = self.slots.partition_point(|s| s.base_gfn <= gfn);
        if idx == 0 {
            return None;
        }
        let slot = &self.slots[idx - 1];
        if slot.contains(gfn) {
            Some(slot)
        } else {
            None
        }
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Arc<MemorySlot>> {
        self.slots.iter().find(|s| s.id == id)
    }
}

/// Failed translation, distinguishing "no owning slot" (an MMIO-shaped access,
/// escalated to the I/O bus) from a permission violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationFault {
    NoSlot { gfn: Gfn, access: Access },
    Permission { gfn: Gfn, access: Access },
}

impl std::fmt::Display for TranslationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSlot { gfn, access } => {
                write!(f, "no slot for gfn {:#x} (access {:?})", gfn, access)
            }
            Self::Permission { gfn, access } => {
                write!(f, "permission violation at gfn {:#x} (access {:?})", gfn, access)
            }
        }
    }
}

/// One leaf entry of the two-level translation table.
///
/// Invariant: a mapping exists only while its guest frame falls inside exactly
/// one active slot, and its permissions never exceed that slot's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFrameMapping {
    pub hfn: Hfn,
    pub perms: Access,
    pub slot: u32,
    pub generation: u64,
    /// Write-tracking armed: a guest write faults instead of retiring.
    pub write_protected: bool,
}

/// 512-entry leaf of the two-level table, indexed by `gfn % 512`.
struct LeafTable {
    entries: Box<[Option<GuestFrameMapping>; LEAF_SPAN as usize]>,
    live: u32,
}

impl LeafTable {
    fn new() -> Self {
        Self { entries: Box::new([None; LEAF_SPAN as usize]), live: 0 }
    }
}

/// Per-vCPU last-used-slot hint, tagged with the slot-table generation and the
/// MMU flush epoch it was resolved under. Stale tags are never trusted.
#[derive(Default)]
pub struct SlotCache {
    slot: Option<Arc<MemorySlot>>,
    generation: u64,
    epoch: u64,
}

impl SlotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, gfn: Gfn, generation: u64, epoch: u64) -> Option<Arc<MemorySlot>> {
        if self.generation != generation || self.epoch != epoch {
            return None;
        }
        self.slot.as_ref().filter(|s| s.contains(gfn)).cloned()
    }

    fn fill(&mut self, slot: Arc<MemorySlot>, generation: u64, epoch: u64) {
        self.slot = Some(slot);
        self.generation = generation;
        self.epoch = epoch;
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}

/// Translation statistics.
#[derive(Debug, Clone, Default)]
pub struct MmuStats {
    pub translations: u64,
    pub cache_hits: u64,
    pub faults_no_slot: u64,
    pub faults_permission: u64,
    pub installs: u64,
    pub replaced: u64,
    pub invalidations: u64,
    pub dirty_marks: u64,
}

/// Resolution of a translation-type VM exit.
#[derive(Debug)]
pub enum FaultResolution {
    /// Mapping installed (and dirty state updated); resume the guest.
    Resolved,
    /// No owning slot: treat as an MMIO access on the I/O bus.
    MmioAccess,
    /// Permission violation with no slot willing to remap; escalate.
    Unresolved(TranslationFault),
    /// Internal consistency violation; fatal to the faulting vCPU.
    Inconsistent(String),
}

/// The hardware-walk view of the translation table: resolves only mappings
/// that are already installed, honoring write protection. Implemented by
/// [`GuestMmu`] and handed to each backend control block at creation.
pub trait TranslationWalker: Send + Sync {
    fn resolve(&self, gfn: Gfn, access: Access) -> Option<Hfn>;
}

/// The VM-wide translation engine (EPT/NPT analog).
///
/// Structural changes (install, invalidate) take the table lock; the fast
/// path in [`TranslationWalker::resolve`] takes the same lock briefly, while
/// slot lookups go through the lock-free copy-on-write slot table plus the
/// per-vCPU [`SlotCache`].
pub struct GuestMmu {
    root: Mutex<HashMap<u64, LeafTable>>,
    flush_epoch: AtomicU64,
    stats: Mutex<MmuStats>,
}

impl GuestMmu {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(HashMap::new()),
            flush_epoch: AtomicU64::new(0),
            stats: Mutex::new(MmuStats::default()),
        }
    }

    /// Current translation-cache flush epoch. Bumped on every broadcast
    /// invalidation; vCPU slot caches revalidate against it.
    pub fn flush_epoch(&self) -> u64 {
        self.flush_epoch.load(Ordering::Acquire)
    }

    fn broadcast_invalidation(&self) {
        self.flush_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolve `gfn` to a host frame through the slot table, denying accesses
    /// that exceed the owning slot's permissions.
    pub fn translate(
        &self,
        table: &SlotTable,
        cache: Option<&mut SlotCache>,
        gfn: Gfn,
        access: Access,
    ) -> Result<Hfn, TranslationFault> {
        let epoch = self.flush_epoch();
        let mut stats = self.stats.lock();
        stats.translations += 1;

        let slot = match cache {
            Some(cache) => match cache.lookup(gfn, table.generation, epoch) {
                Some(slot) => {
                    stats.cache_hits += 1;
                    Some(slot)
                }
                None => {
                    let found = table.find(gfn).cloned();
                    if let Some(slot) = &found {
                        cache.fill(slot.clone(), table.generation, epoch);
                    }
                    found
                }
            },
            None => table.find(gfn).cloned(),
        };

        let slot = match slot {
            Some(slot) => slot,
            None => {
                stats.faults_no_slot += 1;
                return Err(TranslationFault::NoSlot { gfn, access });
            }
        };
        if !slot.allows(access) {
            stats.faults_permission += 1;
            return Err(TranslationFault::Permission { gfn, access });
        }
        Ok(slot.host_frame(gfn))
    }

    /// Install a translation entry. Installing the identical mapping again is
    /// a no-op; installing a different host frame at the same guest frame
    /// first invalidates the old entry and broadcasts a translation-cache
    /// invalidation so no vCPU trusts a stale cached slot.
    pub fn install_mapping(
        &self,
        gfn: Gfn,
        hfn: Hfn,
        perms: Access,
        slot: u32,
        generation: u64,
        write_protected: bool,
    ) {
        let mut root = self.root.lock();
        let leaf = root.entry(gfn / LEAF_SPAN).or_insert_with(LeafTable::new);
        let entry = &mut leaf.entries[(gfn % LEAF_SPAN) as usize];
        let mapping = GuestFrameMapping { hfn, perms, slot, generation, write_protected };
        match entry {
            Some(existing) if existing.hfn == hfn => {
                if *existing != mapping {
                    *existing = mapping;
                }
            }
            Some(_) => {
                // Remapped to a different host frame: old entry is stale
                // everywhere, force every cache to re-resolve.
                *entry = Some(mapping);
                self.broadcast_invalidation();
                self.stats.lock().replaced += 1;
            }
            None => {
                *entry = Some(mapping);
                leaf.live += 1;
                self.stats.lock().installs += 1;
            }
        }
    }

    /// Look up an installed mapping without consulting the slot table.
    pub fn lookup(&self, gfn: Gfn) -> Option<GuestFrameMapping> {
        let root = self.root.lock();
        root.get(&(gfn / LEAF_SPAN))
            .and_then(|leaf| leaf.entries[(gfn % LEAF_SPAN) as usize])
    }

    /// Remove every translation in `[start_gfn, end_gfn)`. Called when host
    /// memory management revokes pages; completes before returning, so any
    /// later translate must re-resolve.
    pub fn invalidate_range(&self, start_gfn: Gfn, end_gfn: Gfn) {
        let mut removed = 0u64;
        {
            let mut root = self.root.lock();
            for gfn in start_gfn..end_gfn {
                if let Some(leaf) = root.get_mut(&(gfn / LEAF_SPAN)) {
                    let entry = &mut leaf.entries[(gfn % LEAF_SPAN) as usize];
                    if entry.take().is_some() {
                        leaf.live -= 1;
                        removed += 1;
                    }
                }
            }
            root.retain(|_, leaf| leaf.live > 0);
        }
        if removed > 0 {
            self.broadcast_invalidation();
            self.stats.lock().invalidations += removed;
            log::debug!("invalidated {} translations in gfn range {:#x}..{:#x}", removed, start_gfn, end_gfn);
        }
    }

    /// Remove every translation owned by `slot`.
    pub fn invalidate_slot(&self, slot: u32) {
        let mut removed = 0u64;
        {
            let mut root = self.root.lock();
            for leaf in root.values_mut() {
                for entry in leaf.entries.iter_mut() {
                    if entry.map_or(false, |m| m.slot == slot) {
                        *entry = None;
                        leaf.live -= 1;
                        removed += 1;
                    }
                }
            }
            root.retain(|_, leaf| leaf.live > 0);
        }
        if removed > 0 {
            self.broadcast_invalidation();
            self.stats.lock().invalidations += removed;
        }
    }

    /// Drop all translations. Used when the slot table is replaced.
    pub fn invalidate_all(&self) {
        let mut root = self.root.lock();
        let removed: u64 = root.values().map(|l| l.live as u64).sum();
        root.clear();
        drop(root);
        if removed > 0 {
            self.broadcast_invalidation();
            self.stats.lock().invalidations += removed;
        }
    }

    /// Resolve a translation-type VM exit for `gfn`/`access`.
    ///
    /// On success the mapping is installed (write-protected when the slot has
    /// dirty logging enabled and this is not the faulting write itself) and
    /// the dirty log updated, with the frame marked strictly before the write
    /// is allowed to retire.
    pub fn handle_fault(
        &self,
        table: &SlotTable,
        cache: Option<&mut SlotCache>,
        gfn: Gfn,
        access: Access,
    ) -> FaultResolution {
        let hfn = match self.translate(table, cache, gfn, access) {
            Ok(hfn) => hfn,
            Err(TranslationFault::NoSlot { .. }) => return FaultResolution::MmioAccess,
            Err(fault @ TranslationFault::Permission { .. }) => {
                return FaultResolution::Unresolved(fault)
            }
        };

        // The slot must exist: translate just resolved through it. A missing
        // slot here means the table changed underneath us in a way the
        // generation scheme should have prevented.
        let slot = match table.find(gfn) {
            Some(slot) => slot,
            None => {
                return FaultResolution::Inconsistent(format!(
                    "gfn {:#x} resolved to hfn {:#x} but no owning slot in generation {}",
                    gfn, hfn, table.generation
                ))
            }
        };

        if let Some(existing) = self.lookup(gfn) {
            if existing.slot != slot.id {
                return FaultResolution::Inconsistent(format!(
                    "mapping for gfn {:#x} owned by slot {} but table says slot {}",
                    gfn, existing.slot, slot.id
                ));
            }
        }

        let is_write = access.contains(Access::WRITE);
        let dirty_logged = slot.dirty_logged();
        // Install write-protected unless this very fault is the write episode.
        let write_protected = dirty_logged && !is_write;
        self.install_mapping(gfn, hfn, slot.max_perms(), slot.id, table.generation, write_protected);

        if is_write && dirty_logged {
            // Mark before the write retires: the guest only re-runs the write
            // after this fault resolution completes.
            slot.mark_dirty(gfn);
            self.stats.lock().dirty_marks += 1;
            log::trace!("dirty mark gfn {:#x} (slot {})", gfn, slot.id);
        }
        FaultResolution::Resolved
    }

    /// Harvest and clear the dirty log of `slot`, re-arming write tracking.
    ///
    /// Re-protection and log collection happen under the table lock, so a
    /// concurrent write cannot retire between the two: it either faulted
    /// before the harvest (and is in this log) or will fault after it.
    pub fn harvest_dirty(&self, slot: &MemorySlot) -> Vec<Gfn> {
        let mut root = self.root.lock();
        for leaf in root.values_mut() {
            for entry in leaf.entries.iter_mut() {
                if let Some(mapping) = entry {
                    if mapping.slot == slot.id {
                        mapping.write_protected = true;
                    }
                }
            }
        }
        let dirty = slot.collect_dirty();
        drop(root);
        dirty
    }

    pub fn stats(&self) -> MmuStats {
        self.stats.lock().clone()
    }
}

impl Default for GuestMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationWalker for GuestMmu {
    fn resolve(&self, gfn: Gfn, access: Access) -> Option<Hfn> {
        let root = self.root.lock();
        let mapping = root
            .get(&(gfn / LEAF_SPAN))
            .and_then(|leaf| leaf.entries[(gfn % LEAF_SPAN) as usize])?;
        if !mapping.perms.contains(access) {
            return None;
        }
        if access.contains(Access::WRITE) && mapping.write_protected {
            return None;
        }
        Some(mapping.hfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(slots: Vec<MemorySlot>) -> SlotTable {
        SlotTable::new(1, slots.into_iter().map(Arc::new).collect())
    }

    #[test]
    fn test_slot_lookup() {
        let table = table_with(vec![
            MemorySlot::new(0, 0, 256, 0x1000, SlotFlags::empty()),
            MemorySlot::new(1, 0x400, 16, 0x2000, SlotFlags::empty()),
        ]);
        assert_eq!(table.find(10).unwrap().id, 0);
        assert_eq!(table.find(255).unwrap().id, 0);
        assert!(table.find(256).is_none());
        assert_eq!(table.find(0x407).unwrap().id, 1);
        assert!(table.find(0x410).is_none());
    }

    #[test]
    fn test_translate_resolves_host_frame() {
        let mmu = GuestMmu::new();
        let table = table_with(vec![MemorySlot::new(0, 0, 256, 0x1000, SlotFlags::empty())]);
        let hfn = mmu.translate(&table, None, 10, Access::READ).unwrap();
        assert_eq!(hfn, 0x100A);
    }

    #[test]
    fn test_translate_denies_beyond_slot_perms() {
        let mmu = GuestMmu::new();
        let table = table_with(vec![MemorySlot::new(0, 0, 16, 0x1000, SlotFlags::READ_ONLY)]);
        assert!(mmu.translate(&table, None, 3, Access::READ).is_ok());
        assert_eq!(
            mmu.translate(&table, None, 3, Access::WRITE),
            Err(TranslationFault::Permission { gfn: 3, access: Access::WRITE })
        );
    }

    #[test]
    fn test_translate_no_slot_is_mmio_shaped() {
        let mmu = GuestMmu::new();
        let table = table_with(vec![MemorySlot::new(0, 0, 16, 0x1000, SlotFlags::empty())]);
        assert_eq!(
            mmu.translate(&table, None, 0x9000, Access::READ),
            Err(TranslationFault::NoSlot { gfn: 0x9000, access: Access::READ })
        );
    }

    #[test]
    fn test_install_idempotent() {
        let mmu = GuestMmu::new();
        let perms = Access::READ | Access::WRITE;
        mmu.install_mapping(10, 0x100A, perms, 0, 1, false);
        mmu.install_mapping(10, 0x100A, perms, 0, 1, false);
        assert_eq!(mmu.stats().installs, 1);
        assert_eq!(mmu.lookup(10).unwrap().hfn, 0x100A);
    }

    #[test]
    fn test_install_replacement_broadcasts() {
        let mmu = GuestMmu::new();
        let perms = Access::READ | Access::WRITE;
        mmu.install_mapping(10, 0x100A, perms, 0, 1, false);
        let epoch = mmu.flush_epoch();
        mmu.install_mapping(10, 0x200A, perms, 0, 2, false);
        assert_eq!(mmu.lookup(10).unwrap().hfn, 0x200A);
        assert!(mmu.flush_epoch() > epoch, "replacement must broadcast an invalidation");
    }

    #[test]
    fn test_invalidate_range_forces_reresolve() {
        let mmu = GuestMmu::new();
        let perms = Access::READ | Access::WRITE;
        mmu.install_mapping(5, 0x1005, perms, 0, 1, false);
        mmu.install_mapping(9, 0x1009, perms, 0, 1, false);
        mmu.install_mapping(20, 0x1014, perms, 0, 1, false);
        mmu.invalidate_range(0, 16);
        assert!(mmu.lookup(5).is_none());
        assert!(mmu.lookup(9).is_none());
        assert_eq!(mmu.lookup(20).unwrap().hfn, 0x1014);
    }

    #[test]
    fn test_walker_honors_write_protect() {
        let mmu = GuestMmu::new();
        let perms = Access::READ | Access::WRITE;
        mmu.install_mapping(7, 0x1007, perms, 0, 1, true);
        assert_eq!(mmu.resolve(7, Access::READ), Some(0x1007));
        assert_eq!(mmu.resolve(7, Access::WRITE), None);
    }

    #[test]
    fn test_slot_cache_revalidation() {
        let mmu = GuestMmu::new();
        let mut cache = SlotCache::new();
        let table = table_with(vec![MemorySlot::new(0, 0, 256, 0x1000, SlotFlags::empty())]);
        mmu.translate(&table, Some(&mut cache), 10, Access::READ).unwrap();
        mmu.translate(&table, Some(&mut cache), 11, Access::READ).unwrap();
        assert_eq!(mmu.stats().cache_hits, 1);

        // New generation: the hint is stale and must not be trusted.
        let table2 = SlotTable::new(
            2,
            vec![Arc::new(MemorySlot::new(0, 0, 8, 0x5000, SlotFlags::empty()))],
        );
        assert!(mmu.translate(&table2, Some(&mut cache), 10, Access::READ).is_err());
        assert_eq!(mmu.translate(&table2, Some(&mut cache), 3, Access::READ).unwrap(), 0x5003);
    }

    #[test]
    fn test_fault_resolution_installs_mapping() {
        let mmu = GuestMmu::new();
        let table = table_with(vec![MemorySlot::new(0, 0, 256, 0x1000, SlotFlags::empty())]);
        match mmu.handle_fault(&table, None, 10, Access::READ) {
            FaultResolution::Resolved => {}
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(mmu.resolve(10, Access::READ), Some(0x100A));
    }

    #[test]
    fn test_dirty_log_exactly_once_per_episode() {
        let mmu = GuestMmu::new();
        let slot = Arc::new(MemorySlot::new(0, 0, 256, 0x1000, SlotFlags::DIRTY_LOG));
        let table = SlotTable::new(1, vec![slot.clone()]);

        // Write fault marks the frame and leaves it unprotected.
        assert!(matches!(
            mmu.handle_fault(&table, None, 10, Access::WRITE),
            FaultResolution::Resolved
        ));
        assert_eq!(mmu.resolve(10, Access::WRITE), Some(0x100A));
        assert!(matches!(
            mmu.handle_fault(&table, None, 200, Access::WRITE),
            FaultResolution::Resolved
        ));

        let dirty = mmu.harvest_dirty(&slot);
        assert_eq!(dirty, vec![10, 200]);

        // Harvest re-armed write tracking; no writes since, so the log is
        // empty and the frames fault again on the next write.
        assert!(mmu.harvest_dirty(&slot).is_empty());
        assert_eq!(mmu.resolve(10, Access::WRITE), None);

        assert!(matches!(
            mmu.handle_fault(&table, None, 10, Access::WRITE),
            FaultResolution::Resolved
        ));
        assert_eq!(mmu.harvest_dirty(&slot), vec![10]);
    }

    #[test]
    fn test_dirty_ring_mode() {
        let mmu = GuestMmu::new();
        let slot = Arc::new(MemorySlot::new(
            0,
            0,
            64,
            0x1000,
            SlotFlags::DIRTY_LOG | SlotFlags::DIRTY_RING,
        ));
        let table = SlotTable::new(1, vec![slot.clone()]);
        for gfn in [9u64, 3, 9] {
            // Second write to 9 retires without a fault; only faults mark.
            if mmu.resolve(gfn, Access::WRITE).is_none() {
                assert!(matches!(
                    mmu.handle_fault(&table, None, gfn, Access::WRITE),
                    FaultResolution::Resolved
                ));
            }
        }
        assert_eq!(mmu.harvest_dirty(&slot), vec![3, 9]);
    }

    #[test]
    fn test_read_fault_installs_write_protected() {
        let mmu = GuestMmu::new();
        let slot = Arc::new(MemorySlot::new(0, 0, 64, 0x1000, SlotFlags::DIRTY_LOG));
        let table = SlotTable::new(1, vec![slot.clone()]);
        assert!(matches!(
            mmu.handle_fault(&table, None, 4, Access::READ),
            FaultResolution::Resolved
        ));
        // Readable but a write must fault so it can be marked dirty.
        assert_eq!(mmu.resolve(4, Access::READ), Some(0x1004));
        assert_eq!(mmu.resolve(4, Access::WRITE), None);
        assert!(mmu.harvest_dirty(&slot).is_empty());
    }
}
