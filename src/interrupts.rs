//! Interrupt and exception dispatch.
//!
//! All 256 vectors are populated at boot: the architecturally defined
//! exceptions terminate the faulting user process (or panic when the
//! kernel itself faults), the PIT/keyboard/RTC vectors route into their
//! drivers, vector 0x80 is the DPL 3 syscall trap gate, and everything
//! else lands in logging stubs.
//!
//! The per-exception diagnostic strings are data, not code: every
//! handler is a thin macro-generated wrapper around [`fault`].

use lazy_static::lazy_static;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};

use crate::drivers::{keyboard, rtc};
use crate::pic::{self, PIC_1_OFFSET, PIC_2_OFFSET};
use crate::process::{self, RETURN_EXCEPTION};
use crate::userspace::{process as uproc, syscall};
use crate::{println, scheduler, serial_println};

/// Vectors of the device interrupts this kernel services.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    /// PIT tick, IRQ 0: drives the scheduler.
    Timer = PIC_1_OFFSET,
    /// PS/2 keyboard, IRQ 1.
    Keyboard,
    /// RTC periodic interrupt, IRQ 8 (first slave vector).
    Rtc = PIC_2_OFFSET,
}

impl InterruptIndex {
    /// Returns the index as a `usize`.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self as usize
    }
}

/// One diagnostic line per architecturally defined exception vector.
/// Vector 15 is reserved by the architecture; 9 exists only on ancient
/// parts and is reserved by the IDT abstraction.
static EXCEPTION_MESSAGES: [&str; 20] = [
    "Divide by 0 error",
    "Debug exception",
    "NMI interrupt",
    "Breakpoint exception",
    "Overflow exception",
    "Bound range exceeded",
    "Invalid opcode exception",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack fault",
    "General protection exception",
    "Page fault",
    "(reserved)",
    "FPU floating point error",
    "Alignment check exception",
    "Machine check exception",
    "SIMD floating point exception",
];

/// An exception terminates the current user process as if it had
/// returned [`RETURN_EXCEPTION`]; with no process to kill, the kernel
/// itself is broken and stops.
fn fault(vector: u8) -> ! {
    println!("EXCEPT {}: {}", vector, EXCEPTION_MESSAGES[vector as usize]);
    serial_println!("EXCEPT {}: {}", vector, EXCEPTION_MESSAGES[vector as usize]);

    if let Some(pcb) = process::current_pcb() {
        // SAFETY:
        // The faulting process is current and its PCB is live; halt
        // tears it down and never returns here.
        unsafe {
            (*pcb).retval = RETURN_EXCEPTION;
        }
        uproc::halt(0);
    }

    panic!("EXCEPT {} in kernel context", vector);
}

macro_rules! exception_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            fault($vector);
        }
    };
}

macro_rules! exception_handler_with_code {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame, error_code: u64) {
            serial_println!("EXCEPT {}: error code {:#x}", $vector, error_code);
            fault($vector);
        }
    };
}

exception_handler!(divide_error_handler, 0);
exception_handler!(debug_handler, 1);
exception_handler!(non_maskable_interrupt_handler, 2);
exception_handler!(overflow_handler, 4);
exception_handler!(bound_range_exceeded_handler, 5);
exception_handler!(invalid_opcode_handler, 6);
exception_handler!(device_not_available_handler, 7);
exception_handler_with_code!(invalid_tss_handler, 10);
exception_handler_with_code!(segment_not_present_handler, 11);
exception_handler_with_code!(stack_segment_fault_handler, 12);
exception_handler_with_code!(general_protection_fault_handler, 13);
exception_handler!(x87_floating_point_handler, 16);
exception_handler_with_code!(alignment_check_handler, 17);
exception_handler!(simd_floating_point_handler, 19);

/// Breakpoints in kernel context resume (the test harness relies on
/// `int3` coming back); in a user process they are fatal like every
/// other exception.
extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    if process::current_pcb().is_some() {
        fault(3);
    }
    serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

/// Page faults additionally report the faulting address from CR2.
extern "x86-interrupt" fn page_fault_handler(
    _stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let accessed = Cr2::read().as_u64();
    println!("Address that was accessed (CR2): {:#x}", accessed);
    serial_println!("page fault at {:#x}, error code {:?}", accessed, error_code);
    fault(14);
}

/// A double fault means a corrupted kernel stack or worse; it runs on
/// its own IST stack (where PCB recovery by masking would lie anyway)
/// and always stops the kernel.
extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    scheduler::handle_irq();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    keyboard::handle_irq();
}

extern "x86-interrupt" fn rtc_interrupt_handler(_stack_frame: InterruptStackFrame) {
    rtc::handle_irq();
}

macro_rules! unhandled_irq_handler {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            serial_println!("unexpected IRQ line {}", $line);
            pic::send_eoi($line);
        }
    };
}

unhandled_irq_handler!(irq2_handler, 2);
unhandled_irq_handler!(irq3_handler, 3);
unhandled_irq_handler!(irq4_handler, 4);
unhandled_irq_handler!(irq5_handler, 5);
unhandled_irq_handler!(irq6_handler, 6);
unhandled_irq_handler!(irq7_handler, 7);
unhandled_irq_handler!(irq9_handler, 9);
unhandled_irq_handler!(irq10_handler, 10);
unhandled_irq_handler!(irq11_handler, 11);
unhandled_irq_handler!(irq12_handler, 12);
unhandled_irq_handler!(irq13_handler, 13);
unhandled_irq_handler!(irq14_handler, 14);
unhandled_irq_handler!(irq15_handler, 15);

/// Vectors nothing ever raises on purpose.
extern "x86-interrupt" fn unexpected_interrupt_handler(_stack_frame: InterruptStackFrame) {
    serial_println!("interrupt on an uninstalled vector");
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        for vector in 32..256 {
            idt[vector].set_handler_fn(unexpected_interrupt_handler);
        }

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt
            .set_handler_fn(non_maskable_interrupt_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);

        // SAFETY:
        // The double fault handler is safe to set as the IST index is
        // backed by a dedicated stack in the TSS.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        idt[InterruptIndex::Rtc.as_usize()].set_handler_fn(rtc_interrupt_handler);

        idt[usize::from(PIC_1_OFFSET) + 2].set_handler_fn(irq2_handler);
        idt[usize::from(PIC_1_OFFSET) + 3].set_handler_fn(irq3_handler);
        idt[usize::from(PIC_1_OFFSET) + 4].set_handler_fn(irq4_handler);
        idt[usize::from(PIC_1_OFFSET) + 5].set_handler_fn(irq5_handler);
        idt[usize::from(PIC_1_OFFSET) + 6].set_handler_fn(irq6_handler);
        idt[usize::from(PIC_1_OFFSET) + 7].set_handler_fn(irq7_handler);
        idt[usize::from(PIC_1_OFFSET) + 9].set_handler_fn(irq9_handler);
        idt[usize::from(PIC_1_OFFSET) + 10].set_handler_fn(irq10_handler);
        idt[usize::from(PIC_1_OFFSET) + 11].set_handler_fn(irq11_handler);
        idt[usize::from(PIC_1_OFFSET) + 12].set_handler_fn(irq12_handler);
        idt[usize::from(PIC_1_OFFSET) + 13].set_handler_fn(irq13_handler);
        idt[usize::from(PIC_1_OFFSET) + 14].set_handler_fn(irq14_handler);
        idt[usize::from(PIC_1_OFFSET) + 15].set_handler_fn(irq15_handler);

        syscall::register(&mut idt);

        idt
    };
}

/// Load the Interrupt Descriptor Table.
pub fn init_idt() {
    IDT.load();
}

#[cfg(test)]
mod tests {
    use x86_64::instructions::interrupts;

    #[test_case]
    fn test_breakpoint_exception_resumes_in_kernel() {
        interrupts::int3();
    }
}
