//! Byte counts formatted for log output.

use core::fmt;

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// A byte count that displays with the largest binary unit that keeps the integer part
/// non-zero, truncated to two decimal places.
///
/// ```
/// use kmm::ByteSize;
///
/// assert_eq!(format!("{}", ByteSize(4096)), "4KiB");
/// assert_eq!(format!("{}", ByteSize(3 << 19)), "1.5MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ByteSize(pub usize);

impl ByteSize {
    /// Byte count of `pages` base pages.
    pub const fn pages(pages: usize) -> Self {
        Self(pages * crate::arch::PAGE_SIZE)
    }
}

impl From<usize> for ByteSize {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut unit = 0;
        while unit + 1 < UNITS.len() && self.0 >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }

        let shift = 10 * unit;
        let whole = self.0 >> shift;
        let rest = self.0 - (whole << shift);
        if rest == 0 {
            return write!(f, "{}{}", whole, UNITS[unit]);
        }

        // Hundredths of the unit, computed in u128 so PiB-scale values cannot overflow.
        let hundredths = ((rest as u128 * 100) >> shift) as usize;
        match (hundredths / 10, hundredths % 10) {
            (0, 0) => write!(f, "{}{}", whole, UNITS[unit]),
            (tenths, 0) => write!(f, "{}.{}{}", whole, tenths, UNITS[unit]),
            _ => write!(f, "{}.{:02}{}", whole, hundredths, UNITS[unit]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_exact_units() {
        assert_eq!(format!("{}", ByteSize(0)), "0B");
        assert_eq!(format!("{}", ByteSize(1023)), "1023B");
        assert_eq!(format!("{}", ByteSize(1 << 10)), "1KiB");
        assert_eq!(format!("{}", ByteSize(2 << 20)), "2MiB");
        assert_eq!(format!("{}", ByteSize(4 << 30)), "4GiB");
    }

    #[test]
    fn formats_fractions() {
        assert_eq!(format!("{}", ByteSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", ByteSize((1 << 30) + (1 << 28))), "1.25GiB");
    }

    #[test]
    fn truncates_tiny_remainders() {
        assert_eq!(format!("{}", ByteSize(1025)), "1KiB");
    }

    #[test]
    fn counts_pages() {
        assert_eq!(ByteSize::pages(512), ByteSize(2 << 20));
    }
}
