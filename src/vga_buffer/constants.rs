//! Geometry of the VGA text buffer.

/// Number of text rows.
pub const BUFFER_HEIGHT: usize = 25;
/// Number of text columns.
pub const BUFFER_WIDTH: usize = 80;
