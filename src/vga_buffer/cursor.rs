//! Hardware cursor positioning through the CRTC index/data ports.

use x86_64::instructions::port::Port;

use super::{constants::BUFFER_WIDTH, screen::Cursor};

const CRTC_INDEX_PORT: u16 = 0x3D4;
const CRTC_DATA_PORT: u16 = 0x3D5;

const CURSOR_LOCATION_HIGH: u8 = 0x0E;
const CURSOR_LOCATION_LOW: u8 = 0x0F;

/// Move the blinking hardware cursor to `cursor`. Only meaningful for
/// the active terminal; inactive terminals keep their cursor purely in
/// software until they are switched in.
pub fn move_to(cursor: Cursor) {
    let position = (cursor.y * BUFFER_WIDTH + cursor.x) as u16;

    let mut index = Port::new(CRTC_INDEX_PORT);
    let mut data = Port::new(CRTC_DATA_PORT);

    // SAFETY:
    // CRTC cursor-location writes only move the visible cursor.
    unsafe {
        index.write(CURSOR_LOCATION_LOW);
        data.write((position & 0xFF) as u8);
        index.write(CURSOR_LOCATION_HIGH);
        data.write((position >> 8) as u8);
    }
}
