//! VGA text-mode building blocks.
//!
//! This module knows how to draw: cell grids, colour codes, cursor I/O
//! and the [`Screen`] writer that the terminal layer drives. It does not
//! know which physical page a screen lives on; the terminal multiplexer
//! decides that by mapping each terminal's backup page (see
//! [`crate::drivers::terminal`]).

pub mod buffer;
pub mod colors;
pub mod cursor;
#[macro_use]
pub mod macros;
pub mod screen;

mod constants;

pub use buffer::{Buffer, ScreenChar};
pub use colors::{Color, ColorCode};
pub use constants::{BUFFER_HEIGHT, BUFFER_WIDTH};
pub use screen::{Cursor, Screen};
