//! Kernel entry point: bring the machine up, mount the boot image and
//! hand terminal 0 its first shell.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use trios::drivers::terminal::MAX_TERMINALS;
use trios::{println, serial_println};

/// The read-only file-system image, baked into the kernel binary. User
/// programs (shell and friends) live here when the image carries them.
static FILESYSTEM_IMAGE: &[u8] = include_bytes!("../fsimg/filesys.img");

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    serial_println!("trios: booting");

    trios::init();
    trios::memory::init(boot_info);
    trios::allocator::init_heap().expect("heap initialization failed");

    if let Err(error) = trios::fs::init(FILESYSTEM_IMAGE) {
        serial_println!("trios: boot image rejected ({:?})", error);
    }

    trios::drivers::terminal::init();
    trios::drivers::keyboard::init();
    trios::drivers::rtc::init();
    trios::scheduler::init();

    println!("trios: {} terminals ready", MAX_TERMINALS);
    serial_println!("trios: starting shell on terminal 0");

    match trios::userspace::process::execute(b"shell") {
        // Resumed only if the scheduler ever hands the boot context the
        // CPU again, which it does not; park regardless.
        Ok(_) => trios::hlt_loop(),
        Err(error) => {
            println!("trios: no shell in the boot image ({:?})", error);
            serial_println!("trios: shell launch failed ({:?})", error);
            x86_64::instructions::interrupts::enable();
            trios::hlt_loop()
        }
    }
}

/// This function is called on panic.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    println!("KERNEL PANIC: {}", info);
    trios::hlt_loop();
}
