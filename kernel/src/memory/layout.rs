//! Canonical kernel virtual-address layout constants.

use x86_64::VirtAddr;

/// Kernel load base (physical, identity-mapped low).
pub const KERNEL_LOW_BASE: u64 = 0x100000;
/// Kernel upper-half base.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Base address for per-CPU kernel stacks.
pub const PERCPU_STACK_REGION_BASE: u64 = 0xffff_c900_0000_0000;
/// Size of each per-CPU kernel stack.
pub const PERCPU_STACK_SIZE: usize = 32 * 1024;
/// Guard page between stacks.
pub const PERCPU_STACK_GUARD_SIZE: usize = 4 * 1024;
/// Stride between per-CPU stack regions (2 MiB aligned).
pub const PERCPU_STACK_STRIDE: usize = 2 * 1024 * 1024;
/// Maximum number of CPUs the layout reserves space for.
pub const MAX_CPUS: usize = 256;

pub fn percpu_stack_base(cpu_id: usize) -> VirtAddr {
    assert!(cpu_id < MAX_CPUS, "CPU ID {} exceeds MAX_CPUS", cpu_id);
    let offset = cpu_id * PERCPU_STACK_STRIDE;
    VirtAddr::new(PERCPU_STACK_REGION_BASE + offset as u64)
}

pub fn percpu_stack_top(cpu_id: usize) -> VirtAddr {
    percpu_stack_base(cpu_id) + PERCPU_STACK_SIZE as u64
}

pub fn log_layout() {
    log::info!(
        "LAYOUT: percpu stack base={:#x}, size={} KiB, stride={} MiB",
        PERCPU_STACK_REGION_BASE,
        PERCPU_STACK_SIZE / 1024,
        PERCPU_STACK_STRIDE / (1024 * 1024)
    );
    log::info!(
        "LAYOUT: reserved-VA bit={:#x}, reserved identity span covers {} GiB",
        super::paging::RESERVED_VA_BIT,
        512
    );
}
