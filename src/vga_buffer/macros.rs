//! Macros for printing to the screen.
//! Kernel text goes to whichever terminal is currently shown; the
//! heavy lifting lives in the terminal multiplexer.

/// Copy of the std print! macro that writes to the active terminal.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::drivers::terminal::_print(format_args!($($arg)*)));
}

/// Copy of the std println! macro that writes to the active terminal.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
