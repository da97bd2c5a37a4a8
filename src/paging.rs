//! Kernel-owned address-space layout and the mapping primitives used by
//! the process model, the terminal multiplexer and the scheduler.
//!
//! The user-visible layout is fixed: the current process image occupies
//! the 4 MiB window at 128 MiB, the optional `vidmap` page sits at
//! 132 MiB, and the per-terminal video backup pages follow it. All three
//! terminals and all processes share one page-table hierarchy; switching
//! processes means re-pointing the user window (and the video page) and
//! flushing the TLB.

use x86_64::{
    instructions::interrupts::without_interrupts,
    structures::paging::{
        mapper::UnmapError, Mapper, Page, PageTableFlags, PhysFrame, Size2MiB, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::memory;

/// Bottom of the user image window (128 MiB).
pub const USER_IMAGE_VIRT: u64 = 0x0800_0000;

/// Size of the user image window (4 MiB, two large pages).
pub const USER_IMAGE_SIZE: u64 = 0x40_0000;

/// The user-accessible video page installed by the `vidmap` system call
/// (132 MiB, directly above the image window).
pub const USER_VIDEO_VIRT: u64 = USER_IMAGE_VIRT + USER_IMAGE_SIZE;

/// First virtual address of the per-terminal video backup pages, one
/// 4 KiB page per terminal, directly above the `vidmap` page.
pub const VIDEO_BACKUP_VIRT_BASE: u64 = USER_VIDEO_VIRT + PAGE_SIZE;

/// 4 KiB.
pub const PAGE_SIZE: u64 = 4096;

/// Physical base of the VGA text buffer.
pub const VRAM_PHYS: u64 = 0xb8000;

/// The physical frame holding the VGA text buffer.
#[must_use]
pub fn vram_frame() -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new(VRAM_PHYS))
}

/// Virtual address of a terminal's backup page.
#[must_use]
pub fn backup_page_virt(terminal: usize) -> VirtAddr {
    VirtAddr::new(VIDEO_BACKUP_VIRT_BASE + terminal as u64 * PAGE_SIZE)
}

/// Point the 4 MiB user window at the process image starting at
/// `phys_base`, replacing whatever the window mapped before.
///
/// `phys_base` must be 2 MiB aligned (the per-pid image slots are 4 MiB
/// aligned, which is stronger). The TLB entries for the window are
/// flushed before this returns.
pub fn map_user_region(phys_base: PhysAddr) {
    let user_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    without_interrupts(|| {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frame_allocator().lock();

        for half in 0..2u64 {
            let page: Page<Size2MiB> =
                Page::containing_address(VirtAddr::new(USER_IMAGE_VIRT + half * 0x20_0000));
            let frame: PhysFrame<Size2MiB> =
                PhysFrame::containing_address(phys_base + half * 0x20_0000);

            discard_unmap(mapper.unmap(page));

            // SAFETY:
            // The window is reserved for the user image; the target frames
            // are the fixed per-pid slots excluded from the frame
            // allocator, so no other mapping aliases them writably.
            unsafe {
                mapper
                    .map_to_with_table_flags(page, frame, user_flags, user_flags, &mut *frames)
                    .expect("user image window mapping failed")
                    .flush();
            }
        }
    });
}

/// Install the user-accessible video page at [`USER_VIDEO_VIRT`],
/// pointing at `frame` (real VRAM or a terminal backup page).
pub fn map_user_video(frame: PhysFrame) {
    let user_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    remap_4k(VirtAddr::new(USER_VIDEO_VIRT), frame, user_flags);
}

/// Remove the user-accessible video page. A no-op when it is not mapped.
pub fn unmap_user_video() {
    without_interrupts(|| {
        let mut mapper = memory::mapper().lock();
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(USER_VIDEO_VIRT));
        discard_unmap(mapper.unmap(page));
        flush_tlb();
    });
}

/// Map a terminal's backup page at `virt`, pointing at `frame` (its own
/// backup frame, or real VRAM while the terminal is active). Supervisor
/// only; user code reaches video memory exclusively through `vidmap`.
pub fn map_backup_page(virt: VirtAddr, frame: PhysFrame) {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    remap_4k(virt, frame, flags);
}

/// Reload CR3, discarding every non-global TLB entry.
pub fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

/// Replace the 4 KiB mapping at `virt` with `frame`.
///
/// The page tables between the video page and the backup pages are
/// shared, so intermediate tables are always created user-accessible and
/// the leaf flags alone decide who may touch the page.
fn remap_4k(virt: VirtAddr, frame: PhysFrame, flags: PageTableFlags) {
    let parent_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    without_interrupts(|| {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frame_allocator().lock();

        let page: Page<Size4KiB> = Page::containing_address(virt);
        discard_unmap(mapper.unmap(page));

        // SAFETY:
        // The 132 MiB+ region is owned by this module; the frames mapped
        // here are VRAM or backup frames that tolerate aliasing by design
        // of the terminal switch protocol.
        unsafe {
            mapper
                .map_to_with_table_flags(page, frame, flags, parent_flags, &mut *frames)
                .expect("video page mapping failed")
                .flush();
        }
    });
}

/// Unmapping a page that was never mapped is expected during the first
/// round of terminal and process setup.
fn discard_unmap<S: x86_64::structures::paging::PageSize>(
    result: Result<(PhysFrame<S>, x86_64::structures::paging::mapper::MapperFlush<S>), UnmapError>,
) {
    match result {
        Ok((_, flush)) => flush.flush(),
        Err(UnmapError::PageNotMapped) => {}
        Err(err) => panic!("unexpected unmap failure: {err:?}"),
    }
}
