//! A simple heap allocator using the `linked_list_allocator` crate.

use linked_list_allocator::LockedHeap;
use x86_64::{
    structures::paging::{
        mapper::MapToError, FrameAllocator, Mapper, Page, PageTableFlags, Size4KiB,
    },
    VirtAddr,
};

use crate::memory;

/// Start address of the heap.
pub const HEAP_START: usize = 0x_4444_4444_0000;
/// Size of the heap in bytes.
pub const HEAP_SIZE: usize = 1000 * 1024; // ~1 MiB

/// Map the heap pages and hand them to the global allocator.
///
/// Requires [`memory::init`] to have run. Must be called exactly once.
///
/// # Errors
/// Fails if the physical memory frame allocator runs out of memory.
pub fn init_heap() -> Result<(), MapToError<Size4KiB>> {
    let mut mapper = memory::mapper().lock();
    let mut frame_allocator = memory::frame_allocator().lock();

    let page_range = {
        let heap_start = VirtAddr::new(HEAP_START as u64);
        let heap_end = heap_start + HEAP_SIZE - 1_u64;
        let heap_start_page = Page::containing_address(heap_start);
        let heap_end_page = Page::containing_address(heap_end);
        Page::range_inclusive(heap_start_page, heap_end_page)
    };

    for page in page_range {
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(MapToError::FrameAllocationFailed)?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        // SAFETY:
        //
        // The heap range is reserved for this allocator and mapped once;
        // the frame was freshly handed out by the frame allocator.
        unsafe {
            mapper
                .map_to(page, frame, flags, &mut *frame_allocator)?
                .flush();
        }
    }

    // SAFETY:
    //
    // The pages mapped above back exactly [HEAP_START, HEAP_START+HEAP_SIZE)
    // and are used for nothing else.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START, HEAP_SIZE);
    }

    Ok(())
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();
