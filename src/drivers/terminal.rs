//! The terminal multiplexer.
//!
//! Three independent terminals share the one VGA text console. Each owns
//! a 4 KiB backup page; the *active* terminal's backup page is remapped
//! as an alias of physical VRAM, so every terminal always draws through
//! its own backup address and the page tables decide whether the bytes
//! hit the screen or the off-screen copy. Switching terminals re-points
//! the aliases and copies the cell contents both ways.
//!
//! Locking discipline: `TERMINALS` is locked from IRQ handlers (keyboard
//! echo, scheduler bookkeeping), so every acquisition outside an IRQ
//! context must run with interrupts disabled. [`with_terminal`] enforces
//! that; use it instead of touching the array directly.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::drivers::keyboard::{self, LineBuffer};
use crate::memory;
use crate::paging;
use crate::pic;
use crate::process::{self, Pid, MAX_PROCESSES};
use crate::scheduler;
use crate::vga_buffer::{cursor, ColorCode, Cursor, Screen};
use crate::{serial_println, userspace};

/// Number of terminals multiplexed over the console.
pub const MAX_TERMINALS: usize = 3;

/// Per-terminal character attributes: white on blue, green and red.
const ATTRIBUTES: [u8; MAX_TERMINALS] = [0x9F, 0x5F, 0x4F];

/// Bytes of one text page that carry cell data (80 x 25 x 2).
const SCREEN_BYTES: usize = 4000;

/// One virtual terminal.
pub struct Terminal {
    index: usize,
    /// Software cursor; pushed to the hardware cursor while active.
    pub cursor: Cursor,
    /// Cell attribute used for everything this terminal draws.
    pub color: ColorCode,
    /// Pending input line, owned by the keyboard IRQ and the reader.
    pub line: LineBuffer,
    /// Stack of live processes in this terminal, bottom (root shell)
    /// first. Only the top entry ever runs.
    children: [Pid; MAX_PROCESSES],
    num_procs: usize,
    backup_virt: VirtAddr,
    backup_frame: PhysFrame,
}

/// Reader/IRQ handshake flags, intentionally outside the terminal lock:
/// the blocked reader spins on `ack` without holding any lock, and the
/// keyboard IRQ sets it.
pub struct TerminalFlags {
    /// A complete line (or control code) is ready for the reader.
    pub ack: AtomicBool,
    /// A reader is waiting; the IRQ may fill the line buffer.
    pub read_ack: AtomicBool,
}

const FLAGS_INIT: TerminalFlags = TerminalFlags {
    ack: AtomicBool::new(false),
    read_ack: AtomicBool::new(false),
};

static FLAGS: [TerminalFlags; MAX_TERMINALS] = [FLAGS_INIT; MAX_TERMINALS];

static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Set once `init` has mapped the backup pages; gates `_print` so early
/// panics fall back to serial only.
static READY: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref TERMINALS: [Mutex<Terminal>; MAX_TERMINALS] = [
        Mutex::new(Terminal::new(0)),
        Mutex::new(Terminal::new(1)),
        Mutex::new(Terminal::new(2)),
    ];
}

impl Terminal {
    fn new(index: usize) -> Self {
        let backup_frame = memory::allocate_frame().expect("no frame for terminal backup page");

        Self {
            index,
            cursor: Cursor::default(),
            color: ColorCode::from_attribute(ATTRIBUTES[index]),
            line: LineBuffer::new(),
            children: [0; MAX_PROCESSES],
            num_procs: 0,
            backup_virt: paging::backup_page_virt(index),
            backup_frame,
        }
    }

    /// The screen this terminal draws to. Where the bytes land is decided
    /// by the current mapping of the backup page.
    fn screen(&mut self) -> Screen {
        // SAFETY:
        // `init` maps every backup page before READY is set, and the
        // switch protocol only ever re-points it, never unmaps it.
        unsafe { Screen::from_ptr(self.backup_virt.as_mut_ptr()) }
    }

    /// Draw one byte at the cursor, scrolling as needed.
    pub fn putc(&mut self, byte: u8) {
        let color = self.color;
        let mut cursor = self.cursor;
        self.screen().put_byte(&mut cursor, color, byte);
        self.cursor = cursor;
        self.sync_hw_cursor();
    }

    /// Erase the last cell, mirroring a line-buffer backspace.
    pub fn backspace(&mut self) {
        let color = self.color;
        let mut cursor = self.cursor;
        self.screen().backspace(&mut cursor, color);
        self.cursor = cursor;
        self.sync_hw_cursor();
    }

    /// Blank the terminal and home the cursor.
    pub fn clear(&mut self) {
        let color = self.color;
        let mut cursor = self.cursor;
        self.screen().clear(&mut cursor, color);
        self.cursor = cursor;
        self.sync_hw_cursor();
    }

    /// Record a new process on top of this terminal's stack.
    pub fn push_child(&mut self, pid: Pid) {
        debug_assert!(self.num_procs < MAX_PROCESSES, "terminal process stack full");
        self.children[self.num_procs] = pid;
        self.num_procs += 1;
    }

    /// Drop the top process from this terminal's stack.
    pub fn pop_child(&mut self) {
        debug_assert!(self.num_procs > 0, "pop from empty terminal");
        self.num_procs -= 1;
        self.children[self.num_procs] = 0;
    }

    /// The process currently entitled to this terminal's foreground.
    #[must_use]
    pub fn top_pid(&self) -> Option<Pid> {
        if self.num_procs == 0 {
            None
        } else {
            Some(self.children[self.num_procs - 1])
        }
    }

    /// Number of live processes in this terminal.
    #[must_use]
    pub const fn process_count(&self) -> usize {
        self.num_procs
    }

    /// The physical frame backing this terminal's off-screen page.
    #[must_use]
    pub const fn backup_frame(&self) -> PhysFrame {
        self.backup_frame
    }

    fn sync_hw_cursor(&self) {
        if self.index == ACTIVE.load(Ordering::SeqCst) {
            cursor::move_to(self.cursor);
        }
    }
}

impl fmt::Write for Terminal {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.putc(byte);
        }
        Ok(())
    }
}

/// Map every backup page, paint each terminal in its colour, alias
/// terminal 0 onto VRAM and show it.
pub fn init() {
    for slot in TERMINALS.iter() {
        let mut term = slot.lock();
        paging::map_backup_page(term.backup_virt, term.backup_frame);
        term.clear();
    }

    let mut term0 = TERMINALS[0].lock();
    paging::map_backup_page(term0.backup_virt, paging::vram_frame());
    term0.clear();
    drop(term0);

    ACTIVE.store(0, Ordering::SeqCst);
    cursor::move_to(Cursor::default());
    READY.store(true, Ordering::SeqCst);
}

/// Index of the terminal shown on the screen.
#[must_use]
pub fn active_index() -> usize {
    ACTIVE.load(Ordering::SeqCst)
}

/// Index of the terminal whose top process owns the CPU.
#[must_use]
pub fn executing_index() -> usize {
    scheduler::executing_terminal()
}

/// Handshake flags of terminal `index`.
#[must_use]
pub fn flags(index: usize) -> &'static TerminalFlags {
    &FLAGS[index]
}

/// Run `f` on terminal `index` with its lock held and interrupts off.
pub fn with_terminal<R>(index: usize, f: impl FnOnce(&mut Terminal) -> R) -> R {
    without_interrupts(|| f(&mut TERMINALS[index].lock()))
}

/// Read one input line from the executing terminal.
///
/// Delegates the blocking part to the keyboard driver. A line opening
/// with CTRL+L clears the screen instead of being delivered: the caller
/// sees zero bytes.
pub fn read(buf: &mut [u8]) -> i64 {
    let count = keyboard::read_line(buf);

    if count > 0 && buf[0] == keyboard::CTRL_L {
        with_terminal(executing_index(), Terminal::clear);
        buf[..count].fill(0);
        return 0;
    }

    count as i64
}

/// Write `buf` to the executing terminal.
///
/// The keyboard line is masked for the duration so echoed input cannot
/// interleave with process output on the same screen.
pub fn write(buf: &[u8]) -> i64 {
    pic::disable_irq(pic::KEYBOARD_LINE);

    with_terminal(executing_index(), |term| {
        for &byte in buf {
            term.putc(byte);
        }
    });

    pic::enable_irq(pic::KEYBOARD_LINE);

    buf.len() as i64
}

/// Make `target` the active terminal.
///
/// Runs from the keyboard IRQ with interrupts off. Refuses the switch
/// when the target is empty and no pid is left for its shell. When the
/// switch spawns a shell, this call does not return until the current
/// kernel context is rescheduled.
pub fn switch_active(target: usize) {
    assert!(target < MAX_TERMINALS, "terminal does not exist");

    let from = ACTIVE.load(Ordering::SeqCst);
    if from == target {
        return;
    }

    let target_empty = with_terminal(target, |term| term.process_count() == 0);
    if target_empty && !process::pid_available() {
        serial_println!("terminal {}: no pid left for a new shell", target);
        return;
    }

    // Give the outgoing terminal its private page back, then preserve
    // what is on the screen.
    let (from_virt, from_frame, from_top) = with_terminal(from, |term| {
        (term.backup_virt, term.backup_frame, term.top_pid())
    });
    paging::map_backup_page(from_virt, from_frame);
    copy_page(vram_ptr(), from_virt.as_mut_ptr());

    // A vidmap the outgoing foreground process holds now aliases the
    // backup, so its continued writes stay off the screen.
    if let Some(pid) = from_top {
        // SAFETY:
        // The pid came off the terminal's live-process stack.
        let pcb = unsafe { &*process::pcb_ptr(pid) };
        if pcb.vidmap_addr != 0 {
            paging::map_user_video(from_frame);
        }
    }

    ACTIVE.store(target, Ordering::SeqCst);

    let (to_virt, to_top, to_cursor, to_empty) = with_terminal(target, |term| {
        (
            term.backup_virt,
            term.top_pid(),
            term.cursor,
            term.process_count() == 0,
        )
    });

    // Restore the incoming screen, then alias its backup onto VRAM.
    copy_page(to_virt.as_mut_ptr(), vram_ptr());
    paging::map_backup_page(to_virt, paging::vram_frame());
    cursor::move_to(to_cursor);

    if to_empty {
        // First visit: give the terminal its root shell. The interrupted
        // process still counts as executing, so the target terminal must
        // be named explicitly. A successful spawn does not come back
        // until this kernel context is rescheduled.
        if let Err(error) = userspace::process::execute_in(b"shell", target) {
            serial_println!("terminal {}: shell spawn failed: {:?}", target, error);
        }
    } else if let Some(pid) = to_top {
        // SAFETY:
        // The pid came off the terminal's live-process stack.
        let pcb = unsafe { &*process::pcb_ptr(pid) };
        if pcb.vidmap_addr != 0 {
            paging::map_user_video(paging::vram_frame());
        }
    }
}

/// Kernel-internal print target: the active terminal.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    if !READY.load(Ordering::SeqCst) {
        return;
    }

    with_terminal(active_index(), |term| {
        term.write_fmt(args).expect("terminal write_fmt failed");
    });
}

fn vram_ptr() -> *mut u8 {
    memory::phys_to_virt(x86_64::PhysAddr::new(paging::VRAM_PHYS)).as_mut_ptr()
}

fn copy_page(src: *const u8, dst: *mut u8) {
    // SAFETY:
    // Both pointers address mapped 4 KiB pages (VRAM through the
    // physical-memory offset, backups through their private mappings),
    // and the two pages are distinct by the switch protocol.
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, SCREEN_BYTES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_child_stack_push_pop() {
        let mut term = Terminal::new(1);

        assert_eq!(term.top_pid(), None, "fresh terminal has no foreground");

        term.push_child(4);
        term.push_child(5);
        assert_eq!(term.process_count(), 2, "both children should be counted");
        assert_eq!(term.top_pid(), Some(5), "newest child is the foreground");

        term.pop_child();
        assert_eq!(term.top_pid(), Some(4), "parent becomes foreground again");
    }

    #[test_case]
    fn test_attributes_are_distinct_per_terminal() {
        assert_ne!(ATTRIBUTES[0], ATTRIBUTES[1], "terminal colours must differ");
        assert_ne!(ATTRIBUTES[1], ATTRIBUTES[2], "terminal colours must differ");
    }
}
