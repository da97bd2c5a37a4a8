//! Legacy dual-PIC (8259) layer.
//!
//! The cascaded master/slave pair is remapped so that IRQ 0 lands on
//! vector 0x20 and IRQ 8 on 0x28, with the slave chained on IRQ 2. On top
//! of the `pic8259` initialization sequence this module exposes per-line
//! masking and end-of-interrupt acknowledgement, which the drivers and the
//! scheduler use directly.

use pic8259::ChainedPics;
use x86_64::instructions::interrupts::without_interrupts;

/// Vector base of the master PIC (first vector after the CPU exceptions).
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base of the slave PIC.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// IRQ line of the programmable interval timer.
pub const PIT_LINE: u8 = 0;
/// IRQ line of the PS/2 keyboard.
pub const KEYBOARD_LINE: u8 = 1;
/// IRQ line of the real-time clock (first slave line).
pub const RTC_LINE: u8 = 8;

/// Number of lines served by one 8259.
const LINES_PER_PIC: u8 = 8;

/// The chained master/slave pair, remapped at [`PIC_1_OFFSET`].
pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Run the ICW1..ICW4 initialization sequence and mask every line except
/// the slave cascade. Device drivers unmask their own lines afterwards.
pub fn init() {
    without_interrupts(|| {
        let mut pics = PICS.lock();

        // SAFETY:
        // The offsets do not collide with CPU exception vectors, and no
        // other code touches the PIC ports during initialization.
        unsafe {
            pics.initialize();
            pics.write_masks(0xFB, 0xFF);
        }
    });
}

/// Unmask IRQ line `line` (0..16) on the owning PIC.
pub fn enable_irq(line: u8) {
    set_mask_bit(line, false);
}

/// Mask IRQ line `line` (0..16) on the owning PIC.
pub fn disable_irq(line: u8) {
    set_mask_bit(line, true);
}

/// Acknowledge IRQ line `line`. For slave lines the master cascade is
/// acknowledged as well (handled inside `pic8259`).
pub fn send_eoi(line: u8) {
    // SAFETY:
    // The vector is one the pair was remapped to serve; an EOI for it
    // only re-arms delivery of that line.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + line);
    }
}

/// Flip a single bit of the interrupt mask pair.
///
/// Callers may run with interrupts enabled (e.g. `terminal_write` masking
/// the keyboard for the duration of a write), so the read-modify-write of
/// the mask registers is done with interrupts off.
fn set_mask_bit(line: u8, masked: bool) {
    debug_assert!(line < 2 * LINES_PER_PIC, "IRQ line out of range");

    without_interrupts(|| {
        let mut pics = PICS.lock();

        // SAFETY:
        // Reading the OCW1 mask registers has no side effects.
        let [mut master, mut slave] = unsafe { pics.read_masks() };

        if line < LINES_PER_PIC {
            if masked {
                master |= 1 << line;
            } else {
                master &= !(1 << line);
            }
        } else {
            let bit = line - LINES_PER_PIC;
            if masked {
                slave |= 1 << bit;
            } else {
                slave &= !(1 << bit);
            }
        }

        // SAFETY:
        // Writing the OCW1 mask registers only gates interrupt delivery;
        // it cannot corrupt controller state.
        unsafe {
            pics.write_masks(master, slave);
        }
    });
}
