pub mod error;
pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod paging;

extern crate alloc;

use bootloader_api::info::MemoryRegions;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::VirtAddr;

use paging::PageTableContext;

static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();
/// The kernel's own page table context, live in CR3 after `init`.
static KERNEL_CONTEXT: OnceCell<Mutex<PageTableContext>> = OnceCell::uninit();

/// Brings up the frame allocator, installs the reserved-VA identity map in
/// the bootloader's active table (adopting it as the kernel's master
/// context), and maps the heap.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    log::info!("Initializing memory management...");
    log::info!("Physical memory offset: {:?}", physical_memory_offset);
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);

    layout::log_layout();

    log::info!("Initializing frame allocator...");
    frame_allocator::init(memory_regions);
    frame_allocator::map_acpi_code_data();

    log::info!("Establishing reserved-VA identity map...");
    let (active_root, _) = Cr3::read();
    let mut ctx = paging::from_active_root(active_root.start_address().as_u64());
    paging::install_reserved_identity_map(&mut ctx, physical_memory_offset.as_u64())
        .expect("failed to install reserved identity map");
    ctx.refill_pools().expect("failed to seed page-table context pools");

    log::info!("Initializing heap allocator...");
    heap::init(&mut ctx).expect("heap initialization failed");

    paging::enable_global_pages();

    frame_allocator::cleanup();

    KERNEL_CONTEXT.init_once(|| Mutex::new(ctx));
    log::info!("Memory management initialized");
}

pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET.get().expect("physical memory offset not initialized")
}

pub fn phys_to_virt(phys: u64, offset: VirtAddr) -> VirtAddr {
    VirtAddr::new(phys + offset.as_u64())
}

/// Runs `f` with the kernel's master page-table context locked.
pub fn with_kernel_context<R>(f: impl FnOnce(&mut PageTableContext) -> R) -> R {
    let ctx = KERNEL_CONTEXT.get().expect("kernel page table context not initialized");
    f(&mut ctx.lock())
}

pub fn debug_memory_info() {
    log::info!("=== Memory Debug Information ===");
    log::info!("Physical memory offset: {:#x}", physical_memory_offset());

    let stats = frame_allocator::memory_stats();
    log::info!(
        "Frame allocator: free={} used={} reserved={}",
        stats.free_frames,
        stats.used_frames,
        stats.reserved_frames
    );

    use alloc::vec::Vec;
    let test_vec: Vec<u8> = Vec::with_capacity(1024);
    log::info!("Heap test vector capacity: {} bytes, ptr={:p}", test_vec.capacity(), test_vec.as_ptr());
    log::info!("=============================");
}

/// Maps a physical MMIO region into the kernel's reserved-VA window,
/// returning the virtual address it landed at. MMIO pages are uncacheable
/// write-through, so they bypass the normal `MapFlags` default.
pub fn map_mmio(phys_addr: u64, size: usize) -> Result<usize, error::MemoryError> {
    let virt_addr = paging::reserved_va_for(phys_addr);
    let size_aligned = (size as u64 + 0xFFF) & !0xFFF;
    let page_count = size_aligned / frame_allocator::PAGE_SIZE;

    log::info!("MMIO: mapping {:#x} -> {:#x} ({} pages)", phys_addr, virt_addr, page_count);

    with_kernel_context(|ctx| -> Result<(), error::MemoryError> {
        for i in 0..page_count {
            let offset = i * frame_allocator::PAGE_SIZE;
            let flags = paging::MapFlags { noexec: true, ..Default::default() };
            let _ = paging::add_page(ctx, virt_addr + offset, phys_addr + offset, flags);
        }
        Ok(())
    })?;

    Ok(virt_addr as usize)
}
