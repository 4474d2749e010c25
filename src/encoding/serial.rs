//! RFC 1982 serial-number arithmetic for delivery-ids and delivery-counts.

/// A 32-bit sequence number with wrapping arithmetic and serial comparison.
///
/// Delivery-ids, delivery-counts, and transfer-ids wrap at 2³²; comparing
/// them as plain integers misorders values across the wrap point, so this
/// type only exposes [`lt`](Self::lt)/[`le`](Self::le) and wrapping addition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SerialNumber(pub u32);

impl SerialNumber {
    /// The raw 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 { self.0 }

    /// Serial "less than": true when `self` precedes `other` in sequence
    /// space, i.e. the forward distance from `self` to `other` is below 2³¹.
    #[must_use]
    pub fn lt(self, other: Self) -> bool {
        self != other && other.0.wrapping_sub(self.0) < 1 << 31
    }

    /// Serial "less than or equal".
    #[must_use]
    pub fn le(self, other: Self) -> bool { self == other || self.lt(other) }

    /// Wrapping addition of an offset.
    #[must_use]
    pub fn add(self, n: u32) -> Self { Self(self.0.wrapping_add(n)) }

    /// The next serial number.
    #[must_use]
    pub fn succ(self) -> Self { self.add(1) }

    /// Forward distance from `other` to `self` in sequence space.
    #[must_use]
    pub fn since(self, other: Self) -> u32 { self.0.wrapping_sub(other.0) }
}

impl From<u32> for SerialNumber {
    fn from(n: u32) -> Self { Self(n) }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

#[cfg(test)]
mod tests {
    use super::SerialNumber;

    #[test]
    fn ordering_is_serial_not_integer() {
        let near_wrap = SerialNumber(u32::MAX - 1);
        let wrapped = near_wrap.add(3);
        assert_eq!(wrapped.value(), 1);
        assert!(near_wrap.lt(wrapped));
        assert!(!wrapped.lt(near_wrap));
        assert!(wrapped.le(wrapped));
    }

    #[test]
    fn distance_wraps() {
        assert_eq!(SerialNumber(2).since(SerialNumber(u32::MAX)), 3);
        assert_eq!(SerialNumber(7).since(SerialNumber(7)), 0);
    }
}
