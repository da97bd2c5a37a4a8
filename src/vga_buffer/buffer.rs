//! Cell-level view of a VGA text page.

use volatile::Volatile;

use super::{
    colors::ColorCode,
    constants::{BUFFER_HEIGHT, BUFFER_WIDTH},
};

/// One full 80x25 text page. Lives over real VRAM or over a terminal's
/// backup page; all accesses go through `Volatile` so the compiler never
/// elides the memory traffic.
#[repr(transparent)]
pub struct Buffer {
    /// The character cells, row major.
    pub chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Represent a character on the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    /// The code-page-437 byte in the cell.
    pub ascii_character: u8,
    /// The attribute (colour) byte of the cell.
    pub color_code: ColorCode,
}

impl ScreenChar {
    /// A blank cell carrying the given attribute.
    #[must_use]
    pub const fn blank(color_code: ColorCode) -> Self {
        Self {
            ascii_character: b' ',
            color_code,
        }
    }
}
