//! Low-level memory management: the active page-table mapper and the
//! physical frame allocator, both built from the bootloader handoff.
//!
//! The bootloader maps all physical memory at a fixed virtual offset,
//! which is what lets the kernel reach the page-table frames, the raw
//! VGA memory and the per-terminal backup pages without further setup.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use bootloader::BootInfo;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{FrameAllocator, OffsetPageTable, PageTable, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

static PHYS_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();
static MAPPER: OnceCell<Mutex<OffsetPageTable<'static>>> = OnceCell::uninit();
static FRAME_ALLOCATOR: OnceCell<Mutex<BootInfoFrameAllocator>> = OnceCell::uninit();

/// Store the physical memory offset and build the global mapper and
/// frame allocator from the bootloader memory map.
///
/// Must be called exactly once, before any [`crate::paging`] operation.
pub fn init(boot_info: &'static BootInfo) {
    let phys_offset = VirtAddr::new(boot_info.physical_memory_offset);

    PHYS_OFFSET.init_once(|| phys_offset);

    // SAFETY:
    // The bootloader maps the complete physical memory at `phys_offset`
    // and this is the only place a mapper over the active table is built.
    let mapper = unsafe { OffsetPageTable::new(active_level_4_table(phys_offset), phys_offset) };
    MAPPER.init_once(|| Mutex::new(mapper));

    // SAFETY:
    // The memory map comes straight from the bootloader handoff.
    let allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };
    FRAME_ALLOCATOR.init_once(|| Mutex::new(allocator));
}

/// The virtual offset at which all physical memory is mapped.
///
/// # Panics
/// Panics when called before [`init`].
pub fn physical_memory_offset() -> VirtAddr {
    *PHYS_OFFSET
        .get()
        .expect("memory::init must run before physical_memory_offset")
}

/// Translate a physical address through the bootloader's linear mapping.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    physical_memory_offset() + phys.as_u64()
}

/// The global mapper over the active level 4 table.
///
/// # Panics
/// Panics when called before [`init`].
pub fn mapper() -> &'static Mutex<OffsetPageTable<'static>> {
    MAPPER.get().expect("memory::init must run before mapper")
}

/// The global physical frame allocator.
///
/// # Panics
/// Panics when called before [`init`].
pub fn frame_allocator() -> &'static Mutex<BootInfoFrameAllocator> {
    FRAME_ALLOCATOR
        .get()
        .expect("memory::init must run before frame_allocator")
}

/// Allocate one 4 KiB frame from the bootloader memory map.
pub fn allocate_frame() -> Option<PhysFrame> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        frame_allocator().lock().allocate_frame()
    })
}

/// Returns a mutable reference to the active level 4 table.
///
/// # Safety
/// The caller must guarantee that the physical memory is mapped to
/// virtual memory at the passed `physical_memory_offset`, and must call
/// this only once to avoid aliasing `&mut` references.
#[must_use]
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    // Cr3 register holds the physical address of the level 4 page table.
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    &mut *page_table_ptr
}

/// A frame allocator that returns usable frames from the bootloader's
/// memory map.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Create a `BootInfoFrameAllocator` from the passed memory map.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the passed memory map is valid and
    /// that frames it reports usable are not in use elsewhere.
    #[must_use]
    pub const unsafe fn new(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let regions = self.memory_map.iter();
        let usable_regions = regions.filter(|r| r.region_type == MemoryRegionType::Usable);
        let addr_ranges = usable_regions.map(|r| r.range.start_addr()..r.range.end_addr());
        let frame_addresses = addr_ranges.flat_map(|r| r.step_by(4096));
        frame_addresses
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
            // The fixed user-image window (8..32 MiB) is handed out by
            // pid, never by this allocator.
            .filter(|frame| {
                let addr = frame.start_address().as_u64();
                !(crate::process::USER_IMAGE_PHYS_BASE
                    ..crate::process::USER_IMAGE_PHYS_END)
                    .contains(&addr)
            })
    }
}

// SAFETY:
// The allocator only reads the static memory map and hands out each
// usable frame at most once.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}
