//! Tests for heap allocation in a `no_std` environment using a custom allocator.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(trios::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use trios::allocator::{self, HEAP_SIZE};
use trios::memory;

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    trios::init();
    memory::init(boot_info);
    allocator::init_heap().expect("heap initialization failed");

    test_main();

    trios::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    trios::test_panic_handler(info)
}

#[test_case]
fn when_creating_simple_allocation_then_memory_is_allocated() {
    let heap_value_1 = Box::new(41);
    let heap_value_2 = Box::new(42);

    assert_eq!(*heap_value_1, 41, "boxed value must survive");
    assert_eq!(*heap_value_2, 42, "boxed value must survive");
}

#[test_case]
fn when_creating_large_vec_then_memory_is_allocated() {
    let mut vec = Vec::new();
    for i in 0..1000u64 {
        vec.push(i);
    }
    assert_eq!(
        vec.iter().sum::<u64>(),
        (0..1000).sum(),
        "vector content must be intact",
    );
}

#[test_case]
fn when_many_boxes_are_allocated_then_memory_is_reused() {
    for i in 0..HEAP_SIZE {
        let x = Box::new(i);
        assert_eq!(*x, i, "allocation must hold its value");
    }
}
