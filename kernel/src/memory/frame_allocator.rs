//! Owns all physical RAM: allocates/reclaims contiguous frame runs and
//! tracks reserved regions published by firmware/ACPI.
//!
//! Grounded on the teacher's region-scan + free-list allocator
//! (`MEMORY_INFO`/`FREE_FRAMES`/`BootInfoFrameAllocator`), reworked around
//! the `Frame { physical_address, count, type, attributes }` run model.

extern crate alloc;

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator as X86FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use super::error::MemoryError;

pub const PAGE_SIZE: u64 = 4096;
/// A run at or above this size must return a 2 MiB-aligned suffix.
const HUGE_PAGE_FRAMES: u64 = (2 * 1024 * 1024) / PAGE_SIZE;
const HUGE_PAGE_ALIGN: u64 = 2 * 1024 * 1024;
/// Below this physical address firmware structures and the real-mode IVT
/// live; the teacher's allocator skips it with the same floor.
const LOW_MEMORY_FLOOR: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Free,
    Used,
    Reserved,
    AcpiReclaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameAttributes(pub u32);

impl FrameAttributes {
    pub const NONE: FrameAttributes = FrameAttributes(0);
    pub const DMA32: FrameAttributes = FrameAttributes(1 << 0);
}

/// A contiguous run of 4 KiB physical pages, tracked as a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub physical_address: u64,
    pub count: u64,
    pub frame_type: FrameType,
    pub attributes: FrameAttributes,
}

impl Frame {
    pub fn size(&self) -> u64 {
        self.count * PAGE_SIZE
    }

    pub fn end_address(&self) -> u64 {
        self.physical_address + self.size()
    }

    fn overlaps(&self, other: &Frame) -> bool {
        self.physical_address < other.end_address() && other.physical_address < self.end_address()
    }

    pub fn as_phys_frame(&self) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(self.physical_address))
    }
}

struct Runs {
    /// Sorted, non-overlapping frame runs spanning all tracked physical memory.
    list: Vec<Frame>,
}

impl Runs {
    const fn new() -> Self {
        Runs { list: Vec::new() }
    }

    fn insert_sorted(&mut self, frame: Frame) {
        let pos = self
            .list
            .iter()
            .position(|f| f.physical_address > frame.physical_address)
            .unwrap_or(self.list.len());
        self.list.insert(pos, frame);
    }
}

static RUNS: Mutex<Runs> = Mutex::new(Runs::new());
static MEMORY_REGIONS: OnceCell<&'static MemoryRegions> = OnceCell::uninit();

/// Populate the free-run list from the bootloader's usable regions.
pub fn init(memory_regions: &'static MemoryRegions) {
    MEMORY_REGIONS.init_once(|| memory_regions);

    let mut runs = RUNS.lock();
    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let start = region.start.max(LOW_MEMORY_FLOOR);
        if start >= region.end {
            continue;
        }
        let count = (region.end - start) / PAGE_SIZE;
        if count == 0 {
            continue;
        }
        runs.insert_sorted(Frame {
            physical_address: start,
            count,
            frame_type: FrameType::Free,
            attributes: FrameAttributes::NONE,
        });
    }
    log::info!("frame allocator: {} usable free runs registered", runs.list.len());
}

/// Split `runs[index]` so that `[at, at+count*PAGE_SIZE)` becomes its own
/// entry, returning its index. `at` must fall within the run and the
/// sub-range must not exceed it.
fn split_out(list: &mut Vec<Frame>, index: usize, at: u64, count: u64) -> usize {
    let run = list[index];
    debug_assert!(run.physical_address <= at);
    debug_assert!(at + count * PAGE_SIZE <= run.end_address());

    let mut insert_at = index;
    let prefix_count = (at - run.physical_address) / PAGE_SIZE;
    let suffix_count = run.count - prefix_count - count;

    list.remove(index);
    if prefix_count > 0 {
        list.insert(
            insert_at,
            Frame { physical_address: run.physical_address, count: prefix_count, ..run },
        );
        insert_at += 1;
    }
    let middle_index = insert_at;
    list.insert(insert_at, Frame { physical_address: at, count, ..run });
    insert_at += 1;
    if suffix_count > 0 {
        list.insert(insert_at, Frame { physical_address: at + count * PAGE_SIZE, count: suffix_count, ..run });
    }
    middle_index
}

/// Allocates/reclaims contiguous frame runs (frame allocator contract).
pub fn allocate(count: u64, frame_type: FrameType, attributes: FrameAttributes) -> Result<Frame, MemoryError> {
    if count == 0 {
        return Err(MemoryError::InvalidArgument);
    }
    let mut guard = RUNS.lock();

    let needs_huge_align = count >= HUGE_PAGE_FRAMES;

    for index in 0..guard.list.len() {
        let run = guard.list[index];
        if run.frame_type != FrameType::Free {
            continue;
        }

        let aligned_start = if needs_huge_align {
            (run.physical_address + HUGE_PAGE_ALIGN - 1) & !(HUGE_PAGE_ALIGN - 1)
        } else {
            run.physical_address
        };

        if aligned_start >= run.end_address() {
            continue;
        }
        let available = (run.end_address() - aligned_start) / PAGE_SIZE;
        if available < count {
            continue;
        }

        let middle = split_out(&mut guard.list, index, aligned_start, count);
        guard.list[middle].frame_type = frame_type;
        guard.list[middle].attributes = attributes;
        return Ok(guard.list[middle]);
    }

    Err(MemoryError::OutOfFrames)
}

/// Allocates a specific physical range (frame allocator contract).
pub fn allocate_at(address: u64, count: u64, frame_type: FrameType, attributes: FrameAttributes) -> Result<Frame, MemoryError> {
    if count == 0 || address % PAGE_SIZE != 0 {
        return Err(MemoryError::InvalidArgument);
    }
    let requested = Frame { physical_address: address, count, frame_type: FrameType::Used, attributes: FrameAttributes::NONE };

    let mut guard = RUNS.lock();
    for index in 0..guard.list.len() {
        let run = guard.list[index];
        if run.frame_type != FrameType::Free {
            if run.overlaps(&requested) {
                return Err(MemoryError::Conflict);
            }
            continue;
        }
        if run.physical_address <= address && address + count * PAGE_SIZE <= run.end_address() {
            let middle = split_out(&mut guard.list, index, address, count);
            guard.list[middle].frame_type = frame_type;
            guard.list[middle].attributes = attributes;
            return Ok(guard.list[middle]);
        }
    }
    Err(MemoryError::Conflict)
}

/// Restores a previously allocated run -- or any sub-run of one -- to the
/// free set. `frame` need not match a tracked run exactly; it only has to
/// fall entirely within one, which is then split so the freed sub-range
/// becomes its own free run.
pub fn free(frame: Frame) {
    let mut guard = RUNS.lock();
    let target_start = frame.physical_address;
    let target_end = frame.end_address();

    let index = guard.list.iter().position(|f| {
        f.frame_type != FrameType::Free && f.physical_address <= target_start && target_end <= f.end_address()
    });

    match index {
        Some(index) => {
            let middle = split_out(&mut guard.list, index, target_start, frame.count);
            guard.list[middle].frame_type = FrameType::Free;
            guard.list[middle].attributes = FrameAttributes::NONE;
        }
        None => panic!("frame allocator: free() of untracked run at {:#x}", frame.physical_address),
    }
}

/// Reserves a range against allocation (used for firmware/ACPI regions).
pub fn reserve(address: u64, count: u64, frame_type: FrameType) -> Result<Frame, MemoryError> {
    allocate_at(address, count, frame_type, FrameAttributes::NONE)
}

/// Looks up the reserved run (if any) covering `address`.
pub fn get_reserved_frames_of(address: u64) -> Option<Frame> {
    let guard = RUNS.lock();
    guard
        .list
        .iter()
        .find(|f| {
            matches!(f.frame_type, FrameType::Reserved | FrameType::AcpiReclaim)
                && f.physical_address <= address
                && address < f.end_address()
        })
        .copied()
}

/// Merges adjacent free runs. Internal corruption (an overlap discovered
/// here) is fatal, matching the contract's failure semantics.
pub fn cleanup() {
    let mut guard = RUNS.lock();
    guard.list.sort_by_key(|f| f.physical_address);

    for pair in guard.list.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            panic!(
                "frame allocator: corruption detected, overlapping runs at {:#x} and {:#x}",
                pair[0].physical_address, pair[1].physical_address
            );
        }
    }

    let mut merged: Vec<Frame> = Vec::with_capacity(guard.list.len());
    for run in guard.list.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.frame_type == FrameType::Free
                && run.frame_type == FrameType::Free
                && last.end_address() == run.physical_address
            {
                last.count += run.count;
                continue;
            }
        }
        merged.push(run);
    }
    guard.list = merged;
}

/// Pre-reserves ACPI regions the firmware advertised in the memory map.
pub fn map_acpi_code_data() {
    let Some(regions) = MEMORY_REGIONS.get() else {
        return;
    };
    for region in regions.iter() {
        let frame_type = match region.kind {
            MemoryRegionKind::UnknownUefi(_) => FrameType::Reserved,
            _ => continue,
        };
        let start = region.start & !(PAGE_SIZE - 1);
        let count = (region.end - start).div_ceil(PAGE_SIZE);
        if count == 0 {
            continue;
        }
        let _ = reserve(start, count, frame_type);
    }
}

/// Allocates a single 4 KiB frame; used while bootstrapping `x86_64::Mapper`.
pub fn allocate_frame() -> Option<PhysFrame<Size4KiB>> {
    allocate(1, FrameType::Used, FrameAttributes::NONE)
        .ok()
        .map(|frame| frame.as_phys_frame())
}

pub fn deallocate_frame(frame: PhysFrame<Size4KiB>) {
    free(Frame {
        physical_address: frame.start_address().as_u64(),
        count: 1,
        frame_type: FrameType::Used,
        attributes: FrameAttributes::NONE,
    });
}

pub struct GlobalFrameAllocator;

unsafe impl X86FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        allocate_frame()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStats {
    pub free_frames: u64,
    pub used_frames: u64,
    pub reserved_frames: u64,
}

pub fn memory_stats() -> MemoryStats {
    let guard = RUNS.lock();
    let mut stats = MemoryStats::default();
    for run in guard.list.iter() {
        match run.frame_type {
            FrameType::Free => stats.free_frames += run.count,
            FrameType::Used => stats.used_frames += run.count,
            FrameType::Reserved | FrameType::AcpiReclaim => stats.reserved_frames += run.count,
        }
    }
    stats
}

#[test_case]
fn allocate_then_free_round_trips() {
    let before = memory_stats().free_frames;
    let frame = allocate(4, FrameType::Used, FrameAttributes::NONE).expect("allocation failed");
    assert_eq!(frame.count, 4);
    free(frame);
    assert_eq!(memory_stats().free_frames, before);
}

#[test_case]
fn allocate_rejects_zero_count() {
    assert_eq!(allocate(0, FrameType::Used, FrameAttributes::NONE), Err(MemoryError::InvalidArgument));
}

#[test_case]
fn free_prefix_then_allocate_same_size_succeeds() {
    // Allocate a 4 MiB region, free the first 2 MiB, cleanup, then allocate
    // 2 MiB again; it must return the freed prefix.
    let big = allocate(1024, FrameType::Used, FrameAttributes::NONE).expect("big alloc failed");
    let prefix = Frame { physical_address: big.physical_address, count: 512, frame_type: FrameType::Used, attributes: FrameAttributes::NONE };
    free(prefix);
    cleanup();
    let reallocated = allocate(512, FrameType::Used, FrameAttributes::NONE).expect("realloc failed");
    assert_eq!(reallocated.physical_address, big.physical_address);
}
