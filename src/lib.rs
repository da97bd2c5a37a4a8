//! trios — a small preemptively-multitasked teaching kernel.
//!
//! The kernel boots into long mode, virtualises memory with paging,
//! services hardware interrupts from the legacy dual-PIC platform,
//! multiplexes three independent text terminals over the shared VGA
//! console, schedules user processes round-robin off the PIT tick and
//! exposes a small UNIX-flavoured system-call surface over a read-only
//! indexed file system.
//!
//! Module dependency order, leaves first: [`pic`] <- [`memory`]/[`paging`]
//! <- [`interrupts`] <- [`drivers`] <- [`process`] <- [`scheduler`] <-
//! [`userspace`].

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod allocator;
pub mod drivers;
pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod memory;
pub mod paging;
pub mod pic;
pub mod process;
pub mod scheduler;
pub mod serial;
pub mod userspace;
pub mod vga_buffer;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Bring up the CPU-local tables and the interrupt controllers.
///
/// Loads the GDT (with ring 3 segments and the TSS), populates and loads
/// the IDT, remaps the PICs with every line masked except the cascade,
/// and enables interrupts. Device lines are unmasked by the individual
/// driver `init` functions.
pub fn init() {
    gdt::init();
    interrupts::init_idt();
    pic::init();
    x86_64::instructions::interrupts::enable();
}

/// Park the CPU, waking only for interrupts.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
bootloader::entry_point!(test_kernel_main);

/// Test entry point for cargo test on the library crate.
#[cfg(test)]
fn test_kernel_main(boot_info: &'static bootloader::BootInfo) -> ! {
    init();
    memory::init(boot_info);
    allocator::init_heap().expect("heap initialization failed");
    test_main();
    hlt_loop();
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// The exit device is configured in the bootimage test-args.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY:
    // Create a `Port` to write exit_code for qemu.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    hlt_loop();
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info);
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
