use conquer_once::spin::OnceCell;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const PAGE_FAULT_IST_INDEX: u16 = 1;

const IST_STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
static mut PAGE_FAULT_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];

static TSS: OnceCell<TaskStateSegment> = OnceCell::uninit();
static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Builds the GDT/TSS and loads them. No userspace segments: the core
/// spec has no ring-3 execution model, only kernel code running linked
/// TOSELF images in ring 0.
pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS};
    use x86_64::instructions::tables::load_tss;

    TSS.init_once(|| {
        let mut tss = TaskStateSegment::new();

        let double_fault_stack_start = VirtAddr::from_ptr(unsafe { &raw const DOUBLE_FAULT_STACK });
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            double_fault_stack_start + IST_STACK_SIZE as u64;

        let page_fault_stack_start = VirtAddr::from_ptr(unsafe { &raw const PAGE_FAULT_STACK });
        tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] =
            page_fault_stack_start + IST_STACK_SIZE as u64;

        tss
    });

    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(TSS.get().unwrap()));
        (gdt, Selectors { code_selector, tss_selector })
    });

    let (gdt, selectors) = GDT.get().unwrap();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        load_tss(selectors.tss_selector);
    }

    log::info!("GDT initialized (code={:#x}, tss={:#x})", selectors.code_selector.0, selectors.tss_selector.0);
}
