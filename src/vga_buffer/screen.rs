//! The screen writer: cursor-addressed character output with scrolling,
//! backspace erasure and clearing.
//!
//! A [`Screen`] is a thin view over one text page. The terminal layer
//! constructs one per write from the terminal's backup-page address, so
//! the page-table mapping (not the writer) decides whether bytes land in
//! real VRAM or in an off-screen backup.

use super::{
    buffer::{Buffer, ScreenChar},
    colors::ColorCode,
    constants::{BUFFER_HEIGHT, BUFFER_WIDTH},
};

/// Cursor position within a text page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Column, 0-based.
    pub x: usize,
    /// Row, 0-based.
    pub y: usize,
}

/// A writer over one mapped text page.
pub struct Screen {
    buffer: *mut Buffer,
}

impl Screen {
    /// Build a screen over the page mapped at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at a mapped, writable 4 KiB text page that stays
    /// mapped for the lifetime of the returned value.
    #[must_use]
    pub const unsafe fn from_ptr(ptr: *mut Buffer) -> Self {
        Self { buffer: ptr }
    }

    fn buffer(&mut self) -> &mut Buffer {
        // SAFETY:
        // Guaranteed mapped and writable by the `from_ptr` contract.
        unsafe { &mut *self.buffer }
    }

    /// Write one byte at the cursor and advance it, handling line wrap,
    /// newline and scrolling. Non-printable bytes render as 0xfe.
    pub fn put_byte(&mut self, cursor: &mut Cursor, color_code: ColorCode, byte: u8) {
        match byte {
            b'\n' => self.new_line(cursor, color_code),
            character => {
                // bytes outside printable ASCII render as a placeholder
                let shown = if (0x20..=0x7e).contains(&character) {
                    character
                } else {
                    0xfe
                };

                if cursor.x >= BUFFER_WIDTH {
                    self.new_line(cursor, color_code);
                }

                self.buffer().chars[cursor.y][cursor.x].write(ScreenChar {
                    ascii_character: shown,
                    color_code,
                });
                cursor.x += 1;
            }
        }
    }

    /// Erase the cell before the cursor and move the cursor back onto it.
    /// Steps across line boundaries; does nothing at the origin.
    pub fn backspace(&mut self, cursor: &mut Cursor, color_code: ColorCode) {
        if cursor.x > 0 {
            cursor.x -= 1;
        } else if cursor.y > 0 {
            cursor.y -= 1;
            cursor.x = BUFFER_WIDTH - 1;
        } else {
            return;
        }

        self.buffer().chars[cursor.y][cursor.x].write(ScreenChar::blank(color_code));
    }

    /// Blank the whole page and move the cursor to the origin.
    pub fn clear(&mut self, cursor: &mut Cursor, color_code: ColorCode) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row, color_code);
        }
        *cursor = Cursor::default();
    }

    /// Read back one cell. Used by the switch logic and by tests.
    #[must_use]
    pub fn char_at(&mut self, x: usize, y: usize) -> ScreenChar {
        self.buffer().chars[y][x].read()
    }

    fn new_line(&mut self, cursor: &mut Cursor, color_code: ColorCode) {
        cursor.x = 0;
        if cursor.y + 1 < BUFFER_HEIGHT {
            cursor.y += 1;
        } else {
            self.scroll_up(color_code);
        }
    }

    /// Move all rows one up and clear the last row.
    fn scroll_up(&mut self, color_code: ColorCode) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let character = self.buffer().chars[row][col].read();
                self.buffer().chars[row - 1][col].write(character);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1, color_code);
    }

    /// Clear a row by filling it with blank characters.
    fn clear_row(&mut self, row: usize, color_code: ColorCode) {
        let blank = ScreenChar::blank(color_code);
        for col in 0..BUFFER_WIDTH {
            self.buffer().chars[row][col].write(blank);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::vga_buffer::colors::Color;

    const COLOR: ColorCode = ColorCode::new(Color::Yellow, Color::Black);

    fn test_page() -> Box<[u8; 4096]> {
        Box::new([0; 4096])
    }

    #[test_case]
    fn test_put_byte_advances_cursor_and_stores_cell() {
        let mut page = test_page();
        // SAFETY: the boxed page outlives the screen below.
        let mut screen = unsafe { Screen::from_ptr(page.as_mut_ptr().cast()) };
        let mut cursor = Cursor::default();

        screen.put_byte(&mut cursor, COLOR, b'A');

        assert_eq!(cursor, Cursor { x: 1, y: 0 }, "cursor should advance");
        assert_eq!(
            screen.char_at(0, 0).ascii_character,
            b'A',
            "cell should hold the written byte",
        );
    }

    #[test_case]
    fn test_newline_at_last_row_scrolls() {
        let mut page = test_page();
        // SAFETY: the boxed page outlives the screen below.
        let mut screen = unsafe { Screen::from_ptr(page.as_mut_ptr().cast()) };
        let mut cursor = Cursor::default();

        screen.put_byte(&mut cursor, COLOR, b'x');
        for _ in 0..BUFFER_HEIGHT {
            screen.put_byte(&mut cursor, COLOR, b'\n');
        }

        assert_eq!(cursor.y, BUFFER_HEIGHT - 1, "cursor should stay on screen");
        assert_eq!(
            screen.char_at(0, 0).ascii_character,
            b' ',
            "first row should have scrolled away",
        );
    }

    #[test_case]
    fn test_backspace_erases_previous_cell() {
        let mut page = test_page();
        // SAFETY: the boxed page outlives the screen below.
        let mut screen = unsafe { Screen::from_ptr(page.as_mut_ptr().cast()) };
        let mut cursor = Cursor::default();

        screen.put_byte(&mut cursor, COLOR, b'z');
        screen.backspace(&mut cursor, COLOR);

        assert_eq!(cursor, Cursor::default(), "cursor should step back");
        assert_eq!(
            screen.char_at(0, 0).ascii_character,
            b' ',
            "erased cell should be blank",
        );
    }
}
