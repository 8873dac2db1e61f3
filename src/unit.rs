//! Utilities for working with raw byte units.

use core::fmt;

/// `1 KiB`
pub const KIB: usize = 1 << 10;
/// `1 MiB`
pub const MIB: usize = 1 << 20;
/// `1 GiB`
pub const GIB: usize = 1 << 30;

/// Wrap the given number of bytes into a [`ByteUnit`] so it
/// can be pretty printed.
pub fn bytes(count: usize) -> ByteUnit {
    ByteUnit(count)
}

/// Wrapper around raw bytes that pretty-prints
/// them using the [`Display`](core::fmt::Display)
/// implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteUnit(pub usize);

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.0 as f64;

        if self.0 < KIB {
            write!(f, "{} B", self.0)
        } else if self.0 < MIB {
            write!(f, "{:.2} KiB", count / KIB as f64)
        } else if self.0 < GIB {
            write!(f, "{:.2} MiB", count / MIB as f64)
        } else {
            write!(f, "{:.2} GiB", count / GIB as f64)
        }
    }
}
