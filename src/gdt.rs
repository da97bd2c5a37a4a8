//! GDT and TSS initialization.
//!
//! The GDT carries kernel and ring 3 code/data segments plus the TSS. The
//! TSS matters for two transitions: RSP0 is loaded on every ring 3 to
//! ring 0 entry (interrupts and `int 0x80`), and the double fault handler
//! runs on a dedicated IST stack. RSP0 is rewritten on every context
//! switch so that each process enters the kernel on its own stack.

use core::ptr::{addr_of, addr_of_mut};

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of the boot kernel stack installed in RSP0 until the first
/// process is scheduled.
const BOOT_STACK_SIZE: usize = 4096 * 5;

/// Size of the double fault handler stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// The single TSS. Mutable because RSP0 changes on every context switch;
/// all writes happen with interrupts disabled (scheduler tick, execute,
/// halt), and the CPU reads the field only on privilege transitions.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Initialize and load the Global Descriptor Table and the TSS.
pub fn init() {
    // SAFETY:
    // Single-threaded boot path; nothing else references TSS yet.
    unsafe {
        let tss = &mut *addr_of_mut!(TSS);

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

            let stack_start = VirtAddr::from_ptr(addr_of!(STACK));
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64
        };

        tss.privilege_stack_table[0] = {
            static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

            let stack_start = VirtAddr::from_ptr(addr_of!(BOOT_STACK));
            stack_start + BOOT_STACK_SIZE as u64
        };
    }

    GDT.0.load();

    // SAFETY:
    // The GDT is loaded and the selectors point at entries it contains.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Point RSP0 at `stack_top`, the kernel stack the CPU switches to on the
/// next ring 3 to ring 0 transition.
///
/// Called by `execute`, `halt` and the scheduler tick, all of which run
/// with interrupts disabled, so the write cannot race a transition that
/// would consume it halfway.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    // SAFETY:
    // Interrupts are off at every call site; the CPU samples RSP0 only on
    // privilege transitions, which cannot occur during the store.
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = stack_top;
    }
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// Holds the GDT segment selectors used during initialization and user
/// mode transitions.
struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());

        // SAFETY:
        // The TSS static lives for the whole kernel lifetime; its stack
        // fields were filled by `init` before the GDT is loaded.
        let tss_selector =
            gdt.add_entry(Descriptor::tss_segment(unsafe { &*addr_of!(TSS) }));

        // Add user mode segments. The selectors returned by `add_entry`
        // have RPL=0, so we create new selectors with RPL=3 for Ring 3
        // execution.
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());

        let user_data_selector = SegmentSelector(user_data_entry.0 | 3);
        let user_code_selector = SegmentSelector(user_code_entry.0 | 3);

        (
            gdt,
            Selectors {
                code_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    };
}
