use linked_list_allocator::LockedHeap;

use super::frame_allocator::{self, FrameAttributes, FrameType};
use super::paging::{self, MapFlags, PageTableContext};
use super::error::MemoryError;

pub const HEAP_START: u64 = 0x_4444_4444_0000;
/// 32 MiB: boot initialization allocations, TOSDB caches, and linker
/// working state.
pub const HEAP_SIZE: u64 = 32 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Maps the heap range into `ctx` one 4 KiB frame at a time, then hands the
/// range to `linked_list_allocator`.
pub fn init(ctx: &mut PageTableContext) -> Result<(), MemoryError> {
    let page_count = HEAP_SIZE / frame_allocator::PAGE_SIZE;
    log::info!(
        "Mapping heap pages from {:#x} to {:#x}",
        HEAP_START,
        HEAP_START + HEAP_SIZE
    );

    for i in 0..page_count {
        let frame = frame_allocator::allocate(1, FrameType::Used, FrameAttributes::NONE)?;
        let va = HEAP_START + i * frame_allocator::PAGE_SIZE;
        paging::add_page(ctx, va, frame.physical_address, MapFlags::default())?;
    }

    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    log::info!("Heap initialized at {:#x} with size {} KiB", HEAP_START, HEAP_SIZE / 1024);
    Ok(())
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
