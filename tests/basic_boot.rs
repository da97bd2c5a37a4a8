//! Simple boot test for the kernel.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(trios::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use trios::{println, serial_println};

/// Entry point for the test.
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();

    trios::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    trios::test_panic_handler(info)
}

/// Printing before the terminals exist must be a safe no-op on screen
/// and still reach the serial port.
#[test_case]
fn test_println_before_terminal_init() {
    println!("println without terminals");
    serial_println!("serial output works");
}
