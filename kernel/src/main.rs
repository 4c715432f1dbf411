#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]

use bootloader_api::BootInfo;

bootloader_api::entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::serial::init();
    kernel::logger::init_early();
    kernel::logger::serial_ready();

    if let Some(framebuffer) = boot_info.framebuffer.as_mut() {
        let info = framebuffer.info();
        kernel::logger::init_framebuffer(framebuffer.buffer_mut(), info);
    }

    kernel::gdt::init();
    kernel::interrupts::init();

    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory offset");
    let memory_regions = &boot_info.memory_regions;
    kernel::memory::init(x86_64::VirtAddr::new(physical_memory_offset), memory_regions);

    kernel::memory::debug_memory_info();
    log::info!("turnstone kernel initialized");

    kernel::hlt_loop();
}

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    kernel::hlt_loop();
}
