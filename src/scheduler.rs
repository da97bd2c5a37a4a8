//! PIT-driven preemptive round-robin across terminals.
//!
//! Each PIT tick (40 Hz) rotates the CPU to the next terminal that has
//! at least one live process, always running that terminal's
//! top-of-stack child. A context switch re-points the user image
//! window, fixes the user video page, updates RSP0 and swaps kernel
//! stacks through [`switch_context`], the single save/load primitive.

use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::instructions::port::Port;
use x86_64::VirtAddr;

use crate::drivers::terminal::{self, MAX_TERMINALS};
use crate::gdt;
use crate::paging;
use crate::pic;
use crate::process::{self, KernelContext, Pcb, Pid};

/// Base frequency of the programmable interval timer.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Scheduler tick rate: 40 Hz, one tick every 25 ms.
pub const TICK_HZ: u32 = 40;

const PIT_DIVISOR: u16 = (PIT_BASE_FREQUENCY / TICK_HZ) as u16;

const PIT_CHANNEL0_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

/// Mode 3 (square wave), channel 0, lobyte/hibyte access.
const PIT_COMMAND_MODE3: u8 = 0x36;

/// The terminal whose top process owns the CPU.
static EXEC_TERM: AtomicUsize = AtomicUsize::new(0);

/// Index of the executing terminal.
#[must_use]
pub fn executing_terminal() -> usize {
    EXEC_TERM.load(Ordering::SeqCst)
}

/// Retarget the executing terminal. Called by `execute` when a process
/// is spawned into a terminal directly (boot shell, switch-spawned
/// shell), always with interrupts disabled.
pub fn set_executing_terminal(index: usize) {
    EXEC_TERM.store(index, Ordering::SeqCst);
}

/// Program channel 0 to the tick rate and unmask the timer line.
pub fn init() {
    let mut command = Port::new(PIT_COMMAND_PORT);
    let mut channel0 = Port::new(PIT_CHANNEL0_PORT);

    // SAFETY:
    // Standard PIT programming: mode byte, then the divisor low byte
    // first and high byte second.
    unsafe {
        command.write(PIT_COMMAND_MODE3);
        channel0.write((PIT_DIVISOR & 0xFF) as u8);
        channel0.write((PIT_DIVISOR >> 8) as u8);
    }

    pic::enable_irq(pic::PIT_LINE);
}

/// Service one timer interrupt. The EOI goes out first so the next tick
/// is armed even while this one still runs on a borrowed stack.
pub fn handle_irq() {
    pic::send_eoi(pic::PIT_LINE);
    tick();
}

/// One scheduling decision: find the next populated terminal after the
/// executing one and switch to its foreground process.
fn tick() {
    let Some(outgoing) = process::current_pcb() else {
        // Still booting; nothing to preempt.
        return;
    };

    let current = executing_terminal();

    let mut counts = [0usize; MAX_TERMINALS];
    for (index, count) in counts.iter_mut().enumerate() {
        *count = terminal::with_terminal(index, |term| term.process_count());
    }

    let Some(next) = next_terminal(current, &counts) else {
        return;
    };

    let Some(incoming) = terminal::with_terminal(next, |term| term.top_pid()) else {
        return;
    };

    context_switch(outgoing, next, incoming);
}

/// The next terminal after `current` (wrapping) with a live process.
/// `None` when no *other* terminal is populated; the executing terminal
/// keeps its slice in that case.
#[must_use]
pub fn next_terminal(current: usize, counts: &[usize; MAX_TERMINALS]) -> Option<usize> {
    for step in 1..MAX_TERMINALS {
        let candidate = (current + step) % MAX_TERMINALS;
        if counts[candidate] > 0 {
            return Some(candidate);
        }
    }
    None
}

/// Move the CPU to `incoming`, the foreground process of `next_term`.
fn context_switch(outgoing: *mut Pcb, next_term: usize, incoming: Pid) {
    let incoming_ptr = process::pcb_ptr(incoming);

    // SAFETY:
    // Both PCBs belong to live pids: `outgoing` was recovered from the
    // running stack, `incoming` came off a terminal's process stack.
    // Interrupts are off (we are inside the timer handler).
    unsafe {
        let incoming_pcb = &*incoming_ptr;

        paging::map_user_region(incoming_pcb.user_phys);
        paging::flush_tlb();

        // The single user video PTE follows the incoming process: real
        // VRAM when its terminal is on screen, that terminal's backup
        // page otherwise, absent when it never called vidmap.
        if incoming_pcb.vidmap_addr == 0 {
            paging::unmap_user_video();
        } else if next_term == terminal::active_index() {
            paging::map_user_video(paging::vram_frame());
        } else {
            let backup = terminal::with_terminal(next_term, |term| term.backup_frame());
            paging::map_user_video(backup);
        }

        gdt::set_kernel_stack(VirtAddr::new(incoming_pcb.esp0));

        EXEC_TERM.store(next_term, Ordering::SeqCst);
        process::set_current_pid(incoming);

        switch_context(&mut (*outgoing).kctx, &incoming_pcb.kctx);
    }
}

/// Save the current kernel continuation into `save`, load the one in
/// `load`, and return *as the loaded continuation*.
///
/// Frame layout contract (shared with the userspace loader's
/// `enter_user`): five callee-saved registers pushed in the order rbx,
/// r12, r13, r14, r15, then `rsp`/`rbp` stored into the context. A
/// continuation created by either primitive can be resumed by either.
///
/// # Safety
/// `load` must hold a continuation captured by this function or by
/// `enter_user`, on a live kernel stack that nothing else has resumed.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(save: *mut KernelContext, load: *const KernelContext) {
    core::arch::naked_asm!(
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov [rdi + 8], rbp",
        "mov rsp, [rsi]",
        "mov rbp, [rsi + 8]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_next_terminal_skips_empty_slots() {
        let counts = [1, 0, 2];
        assert_eq!(
            next_terminal(0, &counts),
            Some(2),
            "terminal 1 is empty, so terminal 2 is next after 0",
        );
    }

    #[test_case]
    fn test_next_terminal_rotates_round_robin() {
        let counts = [1, 1, 1];
        assert_eq!(next_terminal(0, &counts), Some(1), "0 hands over to 1");
        assert_eq!(next_terminal(1, &counts), Some(2), "1 hands over to 2");
        assert_eq!(next_terminal(2, &counts), Some(0), "2 wraps back to 0");
    }

    #[test_case]
    fn test_next_terminal_none_when_alone() {
        let counts = [2, 0, 0];
        assert_eq!(
            next_terminal(0, &counts),
            None,
            "a lone populated terminal keeps the CPU",
        );
    }
}
