//! Device drivers: PS/2 keyboard, real-time clock and the terminal
//! multiplexer they both feed.

pub mod keyboard;
pub mod rtc;
pub mod terminal;
