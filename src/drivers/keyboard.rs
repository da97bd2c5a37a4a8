//! PS/2 keyboard driver and line discipline.
//!
//! Scan codes are decoded by the `pc_keyboard` crate (scan-code set 1,
//! US layout), which also applies shift and caps-lock translation. On
//! top of that this driver tracks ctrl/alt state for control codes and
//! ALT+Fn terminal switching, and assembles decoded characters into the
//! active terminal's line buffer while a reader is waiting.
//!
//! The blocking read side ([`read_line`]) spins on the terminal's `ack`
//! flag with interrupts enabled; the flag is set from this driver's IRQ
//! path when the user presses enter, fills the buffer, or hits a control
//! combination.

use core::sync::atomic::Ordering;

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::drivers::terminal;
use crate::pic;

/// Control code delivered for CTRL+A.
pub const CTRL_A: u8 = 0x01;
/// Control code delivered for CTRL+C.
pub const CTRL_C: u8 = 0x03;
/// Control code delivered for CTRL+L.
pub const CTRL_L: u8 = 0x0C;

/// Capacity of a terminal's line buffer.
pub const LINE_BUFFER_SIZE: usize = 128;

const KEYBOARD_PORT: u16 = 0x60;

const BACKSPACE_CHAR: char = '\u{8}';

/// Scan-code decoder plus the modifier state this driver tracks itself.
/// Shift and caps lock are handled inside `pc_keyboard`.
struct KeyboardState {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    alt: bool,
    ctrl: bool,
}

lazy_static! {
    static ref KEYBOARD: Mutex<KeyboardState> = Mutex::new(KeyboardState {
        decoder: Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore),
        alt: false,
        ctrl: false,
    });
}

/// Reset the active terminal's line state and unmask the keyboard IRQ.
pub fn init() {
    let active = terminal::active_index();
    terminal::with_terminal(active, |term| term.line.clear());
    terminal::flags(active).ack.store(false, Ordering::SeqCst);
    terminal::flags(active).read_ack.store(false, Ordering::SeqCst);

    pic::enable_irq(pic::KEYBOARD_LINE);
}

/// Service one keyboard interrupt: read the scan code, update modifier
/// state, and feed the line discipline of the active terminal.
///
/// Sends its own EOI on every path. On ALT+Fn the EOI goes out *before*
/// the terminal switch, because switching into an empty terminal spawns
/// a shell and does not return until this kernel context is rescheduled.
pub fn handle_irq() {
    let mut port = Port::new(KEYBOARD_PORT);

    // SAFETY:
    // Reading port 0x60 pops the byte the controller just latched.
    let scancode: u8 = unsafe { port.read() };

    let mut state = KEYBOARD.lock();

    let Ok(Some(event)) = state.decoder.add_byte(scancode) else {
        pic::send_eoi(pic::KEYBOARD_LINE);
        return;
    };

    let code = event.code;
    let pressed = event.state == KeyState::Down;

    match code {
        KeyCode::LAlt | KeyCode::RAltGr => {
            state.alt = pressed;
            pic::send_eoi(pic::KEYBOARD_LINE);
            return;
        }
        KeyCode::LControl | KeyCode::RControl => {
            state.ctrl = pressed;
            pic::send_eoi(pic::KEYBOARD_LINE);
            return;
        }
        _ => {}
    }

    if pressed && state.alt {
        if let Some(target) = function_key_terminal(code) {
            drop(state);
            pic::send_eoi(pic::KEYBOARD_LINE);
            terminal::switch_active(target);
            return;
        }
    }

    let ctrl = state.ctrl;
    let decoded = state.decoder.process_keyevent(event);
    drop(state);

    if let Some(key) = decoded {
        handle_key(key, ctrl);
    }

    pic::send_eoi(pic::KEYBOARD_LINE);
}

/// ALT+F1..F3 select a terminal; other keys do not.
fn function_key_terminal(code: KeyCode) -> Option<usize> {
    match code {
        KeyCode::F1 => Some(0),
        KeyCode::F2 => Some(1),
        KeyCode::F3 => Some(2),
        _ => None,
    }
}

/// Run one decoded key through the line discipline of the active
/// terminal.
fn handle_key(key: DecodedKey, ctrl: bool) {
    let DecodedKey::Unicode(character) = key else {
        // arrows, paging and the rest of the raw keys are ignored
        return;
    };

    let active = terminal::active_index();
    let flags = terminal::flags(active);
    let read_ack = flags.read_ack.load(Ordering::SeqCst);

    // Control combinations are swallowed whole while a reader waits;
    // CTRL+L/A/C replace the pending line with a one-byte code.
    if ctrl && read_ack {
        let code = match character {
            'l' | 'L' => Some(CTRL_L),
            'a' | 'A' => Some(CTRL_A),
            'c' | 'C' => Some(CTRL_C),
            _ => None,
        };

        if let Some(code) = code {
            terminal::with_terminal(active, |term| term.line.set_control(code));
            flags.ack.store(true, Ordering::SeqCst);
        }
        return;
    }

    match character {
        // ENTER decodes as LF or CR depending on the layout tables;
        // the line always records LF.
        '\n' | '\r' => {
            terminal::with_terminal(active, |term| {
                if read_ack {
                    term.line.push(b'\n');
                }
                term.putc(b'\n');
            });
            flags.ack.store(true, Ordering::SeqCst);
        }
        BACKSPACE_CHAR => {
            if read_ack {
                terminal::with_terminal(active, |term| {
                    if term.line.pop() {
                        term.backspace();
                    }
                });
            }
        }
        printable => {
            // TAB echoes as a single space
            let byte = if printable == '\t' {
                b' '
            } else if printable.is_ascii() && !printable.is_ascii_control() {
                printable as u8
            } else {
                return;
            };

            let filled = terminal::with_terminal(active, |term| {
                if read_ack {
                    term.line.push(byte);
                }
                term.putc(byte);
                term.line.is_almost_full()
            });

            // A line that reaches its bound is force-terminated so the
            // reader never waits on a buffer that cannot grow.
            if read_ack && filled {
                terminal::with_terminal(active, |term| {
                    term.line.push(b'\n');
                    term.putc(b'\n');
                });
                flags.ack.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Block until the executing terminal has a complete line, then drain up
/// to `buf.len()` bytes of it.
///
/// The spin runs with interrupts enabled: the wake condition is set from
/// the keyboard IRQ, and the PIT keeps preempting this reader so other
/// terminals continue to run. The drain itself masks the keyboard line
/// so the buffer cannot change mid-copy.
pub fn read_line(buf: &mut [u8]) -> usize {
    let term = terminal::executing_index();
    let flags = terminal::flags(term);

    flags.ack.store(false, Ordering::SeqCst);
    flags.read_ack.store(true, Ordering::SeqCst);

    while !flags.ack.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }

    flags.ack.store(false, Ordering::SeqCst);
    flags.read_ack.store(false, Ordering::SeqCst);

    pic::disable_irq(pic::KEYBOARD_LINE);

    let copied = terminal::with_terminal(term, |t| {
        let count = core::cmp::min(buf.len(), t.line.len());
        buf[..count].copy_from_slice(&t.line.as_bytes()[..count]);
        t.line.clear();
        count
    });

    pic::enable_irq(pic::KEYBOARD_LINE);

    copied
}

/// A terminal's pending input line.
#[derive(Debug, Clone, Copy)]
pub struct LineBuffer {
    bytes: [u8; LINE_BUFFER_SIZE],
    len: usize,
}

impl LineBuffer {
    /// An empty line.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0; LINE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Append one byte; returns `false` when the buffer is full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len >= LINE_BUFFER_SIZE {
            return false;
        }
        self.bytes[self.len] = byte;
        self.len += 1;
        true
    }

    /// Remove the last byte; returns `false` on an empty buffer.
    pub fn pop(&mut self) -> bool {
        if self.len == 0 {
            return false;
        }
        self.len -= 1;
        self.bytes[self.len] = 0;
        true
    }

    /// Replace the pending content with a single control code.
    pub fn set_control(&mut self, code: u8) {
        self.clear();
        self.push(code);
    }

    /// Drop all pending bytes.
    pub fn clear(&mut self) {
        self.bytes = [0; LINE_BUFFER_SIZE];
        self.len = 0;
    }

    /// Number of pending bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the line is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One slot short of the forced-newline bound.
    #[must_use]
    pub const fn is_almost_full(&self) -> bool {
        self.len == LINE_BUFFER_SIZE - 2
    }

    /// The pending bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_line_buffer_push_pop_round_trip() {
        let mut line = LineBuffer::new();

        assert!(line.push(b'l'), "push into empty buffer should succeed");
        assert!(line.push(b's'), "push into empty buffer should succeed");
        assert_eq!(line.as_bytes(), b"ls", "buffer should hold pushed bytes");

        assert!(line.pop(), "pop should succeed on non-empty buffer");
        assert_eq!(line.as_bytes(), b"l", "pop should drop the last byte");

        assert!(line.pop(), "pop should succeed on non-empty buffer");
        assert!(!line.pop(), "pop on empty buffer should fail");
    }

    #[test_case]
    fn test_line_buffer_bounds() {
        let mut line = LineBuffer::new();

        for _ in 0..LINE_BUFFER_SIZE {
            assert!(line.push(b'a'), "pushes up to capacity should succeed");
        }
        assert!(!line.push(b'a'), "push past capacity should fail");
        assert_eq!(line.len(), LINE_BUFFER_SIZE, "len should stop at capacity");
    }

    #[test_case]
    fn test_line_buffer_almost_full_at_forced_newline_bound() {
        let mut line = LineBuffer::new();

        for _ in 0..LINE_BUFFER_SIZE - 2 {
            line.push(b'x');
        }

        assert!(
            line.is_almost_full(),
            "bound should trip at capacity minus two so a newline still fits",
        );
    }

    #[test_case]
    fn test_line_buffer_set_control_replaces_content() {
        let mut line = LineBuffer::new();
        line.push(b'o');
        line.push(b'l');
        line.push(b'd');

        line.set_control(CTRL_L);

        assert_eq!(line.as_bytes(), &[CTRL_L], "control code should stand alone");
    }
}
