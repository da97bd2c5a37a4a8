//! Real-time clock driver.
//!
//! The chip is programmed once, at the maximum periodic rate of 1024 Hz,
//! and never touched again. Per-fd frequencies are virtualised on top:
//! `write` on an RTC descriptor stores a tick count (1024 divided by the
//! requested frequency) in the descriptor, and `read` waits for that
//! many hardware ticks. Several descriptors can therefore run at
//! different apparent rates off the single hardware heartbeat.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::port::Port;

use crate::pic;

/// Highest frequency a descriptor may request, and the hardware rate.
pub const MAX_FREQUENCY: u32 = 1024;
/// Lowest frequency a descriptor may request.
pub const MIN_FREQUENCY: u32 = 2;

const RTC_INDEX_PORT: u16 = 0x70;
const RTC_DATA_PORT: u16 = 0x71;

/// Register selectors; bit 7 keeps NMI disabled during programming.
const STATUS_REG_A: u8 = 0x8A;
const STATUS_REG_B: u8 = 0x8B;
const STATUS_REG_C: u8 = 0x0C;

/// Periodic interrupt enable bit in status register B.
const PERIODIC_ENABLE: u8 = 0x40;

/// Rate divider for 1024 Hz: 32768 >> (6 - 1).
const DIVIDER_1024HZ: u8 = 0x06;

/// Set by the IRQ, consumed by blocked readers.
static TICK: AtomicBool = AtomicBool::new(false);

/// Program the periodic interrupt at 1024 Hz and unmask IRQ 8.
pub fn init() {
    TICK.store(false, Ordering::SeqCst);

    let mut index = Port::new(RTC_INDEX_PORT);
    let mut data = Port::new(RTC_DATA_PORT);

    // SAFETY:
    // Standard CMOS register programming: select a register on 0x70,
    // read-modify-write it on 0x71. Interrupts from the chip are still
    // masked at the PIC while this runs.
    unsafe {
        index.write(STATUS_REG_B);
        let prev: u8 = data.read();
        index.write(STATUS_REG_B);
        data.write(prev | PERIODIC_ENABLE);

        index.write(STATUS_REG_A);
        let prev: u8 = data.read();
        index.write(STATUS_REG_A);
        data.write((prev & 0xF0) | DIVIDER_1024HZ);
    }

    pic::enable_irq(pic::RTC_LINE);
}

/// Service one RTC interrupt: record the tick, read status register C so
/// the chip re-arms, and acknowledge the line.
pub fn handle_irq() {
    TICK.store(true, Ordering::SeqCst);

    let mut index = Port::new(RTC_INDEX_PORT);
    let mut data = Port::new(RTC_DATA_PORT);

    // SAFETY:
    // Register C must be read after every IRQ 8 or the chip never
    // raises another one.
    unsafe {
        index.write(STATUS_REG_C);
        let _: u8 = data.read();
    }

    pic::send_eoi(pic::RTC_LINE);
}

/// Block for `ticks` hardware periods.
///
/// Spins with interrupts enabled; the PIT preempts the spinning reader
/// as usual, so other terminals keep running while this one waits.
pub fn wait_ticks(ticks: u32) {
    TICK.store(false, Ordering::SeqCst);

    let mut elapsed = 0;
    while elapsed < ticks {
        while !TICK.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        TICK.store(false, Ordering::SeqCst);
        elapsed += 1;
    }
}

/// Validate a requested frequency and convert it to a hardware tick
/// count per read. Only powers of two in [2, 1024] are accepted.
#[must_use]
pub fn ticks_per_read(frequency: u32) -> Option<u32> {
    if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency) {
        return None;
    }
    if !frequency.is_power_of_two() {
        return None;
    }
    Some(MAX_FREQUENCY / frequency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_power_of_two_frequencies_accepted() {
        assert_eq!(ticks_per_read(2), Some(512), "2 Hz maps to 512 ticks");
        assert_eq!(ticks_per_read(4), Some(256), "4 Hz maps to 256 ticks");
        assert_eq!(ticks_per_read(1024), Some(1), "1024 Hz maps to 1 tick");
    }

    #[test_case]
    fn test_invalid_frequencies_rejected() {
        assert_eq!(ticks_per_read(3), None, "3 is not a power of two");
        assert_eq!(ticks_per_read(0), None, "0 is out of range");
        assert_eq!(ticks_per_read(1), None, "1 is below the minimum");
        assert_eq!(ticks_per_read(2048), None, "2048 is above the hardware rate");
    }
}
