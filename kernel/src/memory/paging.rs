//! Builds, clones, mutates, and tears down 4-level page tables; enforces
//! the reserved-VA↔FA mapping convention.
//!
//! Grounded on the manual PML4→PDPT→PD→PT walk in `PhysAddrWrapper` (this
//! crate's `memory/mod.rs`) and on the teacher's `OffsetPageTable`-based
//! paging code, but hand-rolled rather than delegated to `x86_64::Mapper`
//! so that the context's own interior frame pools can satisfy interior
//! allocations before the global frame allocator exists.

extern crate alloc;

use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::PhysAddr;

use super::error::MemoryError;
use super::frame_allocator::{self, Frame, FrameAttributes, FrameType};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB2: u64 = 2 * 1024 * 1024;
const KIB4: u64 = 4096;

/// High bit marking an identity-mapped "reserved" virtual address. The
/// kernel installs a 1 GiB-hugepage identity map under this bit at boot;
/// converting a frame address to its reserved VA is then a pure OR.
pub const RESERVED_VA_BIT: u64 = 1 << 46;
/// How much physical memory the reserved identity map covers (512 GiB via
/// one full PDPT of 1 GiB hugepages).
const RESERVED_IDENTITY_SPAN: u64 = 512 * GIB;

pub fn reserved_va_for(fa: u64) -> u64 {
    fa | RESERVED_VA_BIT
}

pub fn fa_for_reserved_va(va: u64) -> u64 {
    va & !RESERVED_VA_BIT
}

fn is_aligned(addr: u64, align: u64) -> bool {
    addr % align == 0
}

fn table_at(phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(reserved_va_for(phys) as *mut PageTable) }
}

fn zero_table(phys: u64) {
    table_at(phys).zero();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags {
    pub huge_1g: bool,
    pub huge_2m: bool,
    pub readonly: bool,
    pub noexec: bool,
    pub user: bool,
    pub internal: bool,
    pub will_delete: bool,
}

impl MapFlags {
    fn leaf_table_flags(self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if !self.readonly {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.noexec {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if self.internal {
            flags |= PageTableFlags::BIT_9;
        }
        if self.will_delete {
            flags |= PageTableFlags::BIT_10;
        }
        flags
    }
}

fn interior_table_flags(user: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    flags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Initialized,
}

const POOL_CAPACITY: usize = 512;

/// A small stack of pre-reserved physical frames consumed by interior-node
/// allocation before the global frame allocator is safe to call.
struct FramePool {
    frames: [u64; POOL_CAPACITY],
    len: usize,
}

impl FramePool {
    const fn empty() -> Self {
        FramePool { frames: [0; POOL_CAPACITY], len: 0 }
    }

    fn push(&mut self, frame: u64) {
        if self.len < POOL_CAPACITY {
            self.frames[self.len] = frame;
            self.len += 1;
        }
    }

    fn pop(&mut self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            self.len -= 1;
            Some(self.frames[self.len])
        }
    }

    fn fill_from_allocator(&mut self) -> Result<(), MemoryError> {
        while self.len < POOL_CAPACITY {
            let frame = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE)?;
            self.push(frame.physical_address);
        }
        Ok(())
    }
}

/// Owns a 4-level page table tree plus two small pools of pre-reserved
/// frames for interior-node allocation while bootstrapping (before the
/// global frame allocator is safe to call).
pub struct PageTableContext {
    pub root_frame: u64,
    pool_1: FramePool,
    pool_2: FramePool,
    pub helper_frame: u64,
    pub init_state: InitState,
}

impl PageTableContext {
    fn take_interior_frame(&mut self) -> Result<u64, MemoryError> {
        if let Some(f) = self.pool_1.pop() {
            return Ok(f);
        }
        if let Some(f) = self.pool_2.pop() {
            return Ok(f);
        }
        match self.init_state {
            InitState::Initializing => Err(MemoryError::OutOfPool),
            _ => frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE)
                .map(|f| f.physical_address),
        }
    }

    /// Tops up both pools from the global allocator. Call once the global
    /// allocator is live, before heavy mapping traffic begins; transitions
    /// the context to `Initialized`.
    pub fn refill_pools(&mut self) -> Result<(), MemoryError> {
        self.pool_1.fill_from_allocator()?;
        self.pool_2.fill_from_allocator()?;
        self.init_state = InitState::Initialized;
        Ok(())
    }
}

/// Builds a fresh, empty context rooted at `internal_frame`. Pools start
/// empty; the context stays `Initializing` until `refill_pools` succeeds,
/// during which only pool-backed interior allocations can proceed.
pub fn build_empty_table(internal_frame: u64) -> PageTableContext {
    zero_table(internal_frame);
    PageTableContext {
        root_frame: internal_frame,
        pool_1: FramePool::empty(),
        pool_2: FramePool::empty(),
        helper_frame: internal_frame,
        init_state: InitState::Initializing,
    }
}

/// Wraps the page table the processor is already running on (read from
/// CR3) without zeroing it. Used once, at boot, to turn the bootloader's
/// table into the kernel's master context in place.
pub fn from_active_root(root_frame: u64) -> PageTableContext {
    PageTableContext {
        root_frame,
        pool_1: FramePool::empty(),
        pool_2: FramePool::empty(),
        helper_frame: root_frame,
        init_state: InitState::Initializing,
    }
}

fn table_at_offset(phys: u64, offset: u64) -> &'static mut PageTable {
    unsafe { &mut *((phys + offset) as *mut PageTable) }
}

/// Installs the 1 GiB-hugepage reserved identity map covering
/// `RESERVED_IDENTITY_SPAN` bytes of physical memory in `ctx`.
///
/// This has to happen before anything in this module can use
/// `reserved_va_for`/`table_at` at all, so it bootstraps through the
/// bootloader's own physical-memory direct map (`phys_mem_offset`) rather
/// than the reserved-VA convention it is busy establishing. Once this
/// returns, every other function in this module works off the fixed bit
/// pattern and `phys_mem_offset` is no longer needed.
pub fn install_reserved_identity_map(ctx: &mut PageTableContext, phys_mem_offset: u64) -> Result<(), MemoryError> {
    let p4_idx = ((RESERVED_VA_BIT >> 39) & 0x1FF) as usize;
    let root = table_at_offset(ctx.root_frame, phys_mem_offset);
    let p4e = &root[p4_idx];
    let pdpt_phys = if p4e.flags().contains(PageTableFlags::PRESENT) {
        p4e.addr().as_u64()
    } else {
        let frame = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE)?;
        table_at_offset(frame.physical_address, phys_mem_offset).zero();
        table_at_offset(ctx.root_frame, phys_mem_offset)[p4_idx].set_addr(
            PhysAddr::new(frame.physical_address),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        frame.physical_address
    };
    let pdpt = table_at_offset(pdpt_phys, phys_mem_offset);
    let entries = (RESERVED_IDENTITY_SPAN / GIB) as usize;
    for (i, entry) in pdpt.iter_mut().enumerate().take(entries) {
        let phys = (i as u64) * GIB;
        entry.set_addr(
            PhysAddr::new(phys),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE,
        );
    }
    Ok(())
}

fn get_or_create_child(ctx: &mut PageTableContext, table_phys: u64, idx: usize, user: bool) -> Result<u64, MemoryError> {
    let existing = {
        let table = table_at(table_phys);
        let entry = &table[idx];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(MemoryError::AlreadyMapped);
            }
            Some(entry.addr().as_u64())
        } else {
            None
        }
    };
    if let Some(child) = existing {
        return Ok(child);
    }
    let child = ctx.take_interior_frame()?;
    zero_table(child);
    table_at(table_phys)[idx].set_addr(PhysAddr::new(child), interior_table_flags(user));
    Ok(child)
}

fn set_leaf(table_phys: u64, idx: usize, fa: u64, flags: MapFlags) -> Result<(), MemoryError> {
    let table = table_at(table_phys);
    let entry = &table[idx];
    if entry.flags().contains(PageTableFlags::PRESENT) {
        if entry.addr().as_u64() != fa {
            return Err(MemoryError::AlreadyMapped);
        }
        return Ok(());
    }
    let mut table_flags = flags.leaf_table_flags();
    if flags.huge_1g || flags.huge_2m {
        table_flags |= PageTableFlags::HUGE_PAGE;
    }
    table_at(table_phys)[idx].set_addr(PhysAddr::new(fa), table_flags);
    Ok(())
}

fn indices(va: u64) -> (usize, usize, usize, usize) {
    (
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    )
}

/// Installs a mapping at `va` pointing to `fa` with the given flags,
/// creating whatever interior nodes the path is missing.
pub fn add_page(ctx: &mut PageTableContext, va: u64, fa: u64, flags: MapFlags) -> Result<(), MemoryError> {
    let (p4_idx, p3_idx, p2_idx, p1_idx) = indices(va);
    let huge_1g = flags.huge_1g && is_aligned(va, GIB) && is_aligned(fa, GIB);
    let huge_2m = !huge_1g && flags.huge_2m && is_aligned(va, MIB2) && is_aligned(fa, MIB2);

    let pdpt = get_or_create_child(ctx, ctx.root_frame, p4_idx, flags.user)?;
    if huge_1g {
        return set_leaf(pdpt, p3_idx, fa, flags);
    }

    let pd = get_or_create_child(ctx, pdpt, p3_idx, flags.user)?;
    if huge_2m {
        return set_leaf(pd, p2_idx, fa, flags);
    }

    let pt = get_or_create_child(ctx, pd, p2_idx, flags.user)?;
    set_leaf(pt, p1_idx, fa, flags)
}

/// Walks to `va`'s leaf, honoring whatever granularity is present, without
/// creating missing interior nodes. Returns `(table_phys, index, page_size)`.
fn walk_leaf(ctx: &PageTableContext, va: u64) -> Option<(u64, usize, u64)> {
    let (p4_idx, p3_idx, p2_idx, p1_idx) = indices(va);

    let p4e = &table_at(ctx.root_frame)[p4_idx];
    if !p4e.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let pdpt_phys = p4e.addr().as_u64();

    let p3e_flags;
    let p3e_addr;
    {
        let p3e = &table_at(pdpt_phys)[p3_idx];
        if !p3e.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        p3e_flags = p3e.flags();
        p3e_addr = p3e.addr().as_u64();
    }
    if p3e_flags.contains(PageTableFlags::HUGE_PAGE) {
        return Some((pdpt_phys, p3_idx, GIB));
    }
    let pd_phys = p3e_addr;

    let p2e_flags;
    let p2e_addr;
    {
        let p2e = &table_at(pd_phys)[p2_idx];
        if !p2e.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        p2e_flags = p2e.flags();
        p2e_addr = p2e.addr().as_u64();
    }
    if p2e_flags.contains(PageTableFlags::HUGE_PAGE) {
        return Some((pd_phys, p2_idx, MIB2));
    }
    let pt_phys = p2e_addr;

    let present = table_at(pt_phys)[p1_idx].flags().contains(PageTableFlags::PRESENT);
    if !present {
        return None;
    }
    Some((pt_phys, p1_idx, KIB4))
}

/// Removes a leaf mapping, returning its backing frame address.
pub fn delete_page(ctx: &mut PageTableContext, va: u64) -> Option<u64> {
    let (table_phys, idx, _) = walk_leaf(ctx, va)?;
    let table = table_at(table_phys);
    let fa = table[idx].addr().as_u64();
    table[idx].set_unused();
    Some(fa)
}

/// Walks the tree, honoring hugepages, and resolves the physical address
/// backing `va`, offset included.
pub fn get_physical_address(ctx: &PageTableContext, va: u64) -> Option<u64> {
    let (table_phys, idx, page_size) = walk_leaf(ctx, va)?;
    let base = table_at(table_phys)[idx].addr().as_u64();
    Some(base + (va & (page_size - 1)))
}

pub fn toggle_attributes(ctx: &mut PageTableContext, va: u64, flags: MapFlags) -> Result<(), MemoryError> {
    let (table_phys, idx, _) = walk_leaf(ctx, va).ok_or(MemoryError::NotMapped)?;
    let table = table_at(table_phys);
    let addr = table[idx].addr();
    let mut existing = table[idx].flags();
    existing.set(PageTableFlags::WRITABLE, !flags.readonly);
    existing.set(PageTableFlags::USER_ACCESSIBLE, flags.user);
    existing.set(PageTableFlags::NO_EXECUTE, flags.noexec);
    table[idx].set_addr(addr, existing);
    Ok(())
}

pub fn set_user_accessible(ctx: &mut PageTableContext, va: u64) -> Result<(), MemoryError> {
    let (table_phys, idx, _) = walk_leaf(ctx, va).ok_or(MemoryError::NotMapped)?;
    let table = table_at(table_phys);
    let addr = table[idx].addr();
    let mut flags = table[idx].flags();
    flags.insert(PageTableFlags::USER_ACCESSIBLE);
    table[idx].set_addr(addr, flags);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearWhich {
    Dirty,
    Accessed,
}

pub fn clear_page(ctx: &mut PageTableContext, va: u64, which: ClearWhich) -> Result<(), MemoryError> {
    let (table_phys, idx, _) = walk_leaf(ctx, va).ok_or(MemoryError::NotMapped)?;
    let table = table_at(table_phys);
    let addr = table[idx].addr();
    let mut flags = table[idx].flags();
    match which {
        ClearWhich::Dirty => flags.remove(PageTableFlags::DIRTY),
        ClearWhich::Accessed => flags.remove(PageTableFlags::ACCESSED),
    }
    table[idx].set_addr(addr, flags);
    Ok(())
}

/// Bulk-maps a whole frame run starting at `va_start`, one 4 KiB page at a
/// time (hugepage promotion is left to callers that know the run is
/// contiguous and aligned; see `add_page` for the granularity itself).
pub fn add_va_for_frame(ctx: &mut PageTableContext, va_start: u64, frame: Frame, flags: MapFlags) -> Result<(), MemoryError> {
    for i in 0..frame.count {
        add_page(ctx, va_start + i * KIB4, frame.physical_address + i * KIB4, flags)?;
    }
    Ok(())
}

pub fn delete_va_for_frame(ctx: &mut PageTableContext, va_start: u64, count: u64) {
    for i in 0..count {
        delete_page(ctx, va_start + i * KIB4);
    }
}

fn copy_subtree(src_phys: u64, depth: u32, dst_ctx: &mut PageTableContext) -> Result<u64, MemoryError> {
    let dst_phys = dst_ctx.take_interior_frame()?;
    zero_table(dst_phys);
    for i in 0..512 {
        let (flags, addr, huge, present) = {
            let src = table_at(src_phys);
            let entry = &src[i];
            (
                entry.flags(),
                entry.addr().as_u64(),
                entry.flags().contains(PageTableFlags::HUGE_PAGE),
                entry.flags().contains(PageTableFlags::PRESENT),
            )
        };
        if !present {
            continue;
        }
        if depth == 0 || huge {
            table_at(dst_phys)[i].set_addr(PhysAddr::new(addr), flags);
            continue;
        }
        let child_phys = copy_subtree(addr, depth - 1, dst_ctx)?;
        table_at(dst_phys)[i].set_addr(PhysAddr::new(child_phys), flags);
    }
    Ok(dst_phys)
}

/// Deep-copies `ctx` into a freshly allocated root.
pub fn clone_pagetable(ctx: &PageTableContext) -> Result<PageTableContext, MemoryError> {
    let root = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE)?;
    clone_pagetable_to_frames(ctx, root.physical_address)
}

/// Deep-copies `ctx` into the caller-supplied, already-allocated `target_fa`.
pub fn clone_pagetable_to_frames(ctx: &PageTableContext, target_fa: u64) -> Result<PageTableContext, MemoryError> {
    let mut new_ctx = PageTableContext {
        root_frame: target_fa,
        pool_1: FramePool::empty(),
        pool_2: FramePool::empty(),
        helper_frame: target_fa,
        init_state: InitState::Initialized,
    };
    match copy_subtree(ctx.root_frame, 2, &mut new_ctx) {
        Ok(root) => {
            new_ctx.root_frame = root;
            Ok(new_ctx)
        }
        Err(e) => {
            destroy_pagetable(new_ctx);
            Err(e)
        }
    }
}

fn free_subtree(phys: u64, depth: u32) {
    if depth > 0 {
        let children: alloc::vec::Vec<u64> = {
            let table = table_at(phys);
            table
                .iter()
                .filter(|e| e.flags().contains(PageTableFlags::PRESENT) && !e.flags().contains(PageTableFlags::HUGE_PAGE))
                .map(|e| e.addr().as_u64())
                .collect()
        };
        for child in children {
            free_subtree(child, depth - 1);
        }
    }
    frame_allocator::free(Frame {
        physical_address: phys,
        count: 1,
        frame_type: FrameType::Used,
        attributes: FrameAttributes::NONE,
    });
}

/// Tears down every interior node (PDPT/PD/PT and the root). Leaf target
/// frames are owned by whoever mapped them and are never freed here.
pub fn destroy_pagetable(ctx: PageTableContext) {
    free_subtree(ctx.root_frame, 2);
}

/// Installs `ctx`'s root into CR3, returning the physical address of the
/// table that was active beforehand. Passing `None` only reads the
/// current root.
pub fn switch_table(ctx: Option<&PageTableContext>) -> u64 {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    let (current_frame, _) = Cr3::read();
    let previous = current_frame.start_address().as_u64();
    if let Some(ctx) = ctx {
        let frame = x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(ctx.root_frame));
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
    previous
}

/// Enables CR4.PGE so TLB entries tagged global survive CR3 reloads.
pub fn enable_global_pages() {
    use x86_64::registers::control::{Cr4, Cr4Flags};
    unsafe {
        Cr4::update(|flags| flags.insert(Cr4Flags::PAGE_GLOBAL));
    }
}

#[test_case]
fn reserved_va_conversion_is_involutive() {
    let fa = 0x2000u64;
    assert_eq!(fa_for_reserved_va(reserved_va_for(fa)), fa);
}

#[test_case]
fn add_page_then_get_physical_address_round_trips() {
    let root = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE).expect("root frame");
    let mut ctx = build_empty_table(root.physical_address);
    ctx.refill_pools().expect("refill pools");

    let backing = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE).expect("backing frame");
    let va = 0x1000_0000u64;
    add_page(&mut ctx, va, backing.physical_address, MapFlags::default()).expect("add_page");
    assert_eq!(get_physical_address(&ctx, va), Some(backing.physical_address));

    assert_eq!(delete_page(&mut ctx, va), Some(backing.physical_address));
    assert_eq!(get_physical_address(&ctx, va), None);

    frame_allocator::free(backing);
    destroy_pagetable(ctx);
}

#[test_case]
fn add_page_rejects_conflicting_remap() {
    let root = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE).expect("root frame");
    let mut ctx = build_empty_table(root.physical_address);
    ctx.refill_pools().expect("refill pools");

    let a = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE).expect("frame a");
    let b = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE).expect("frame b");
    let va = 0x2000_0000u64;
    add_page(&mut ctx, va, a.physical_address, MapFlags::default()).expect("first map");
    assert_eq!(
        add_page(&mut ctx, va, b.physical_address, MapFlags::default()),
        Err(MemoryError::AlreadyMapped)
    );

    frame_allocator::free(a);
    frame_allocator::free(b);
    destroy_pagetable(ctx);
}
