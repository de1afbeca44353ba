//! Bit wiring of the board's outputs and the attribute text format
//!
//! The firmware stores the 7-segment display and the LED bargraph as raw
//! port bytes whose bit order follows the PCB traces, not the order a user
//! would expect. [`BitPermutation`] translates between the logical value
//! (bit 0 = segment a / bottom LED) and the byte exchanged on the wire.

/// Text returned instead of a pattern while the device is suspended
pub const SUSPENDED_SENTINEL: &str = "S ";

/// Fixed permutation between logical bit positions and wire bit positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPermutation {
    /// `wire_bit[n]` is the wire bit carrying logical bit `n`
    wire_bit: [u8; 8],
}

impl BitPermutation {
    /// 7-segment display: decimal point and segment g are crossed with d/e/f
    pub const SEGMENTS: BitPermutation = BitPermutation {
        wire_bit: [0, 1, 2, 7, 4, 6, 5, 3],
    };

    /// LED bargraph: the top five LEDs sit on the low port bits
    pub const BARGRAPH: BitPermutation = BitPermutation {
        wire_bit: [5, 6, 7, 0, 1, 2, 3, 4],
    };

    /// Translate a logical value into the byte sent to the device
    pub fn to_wire(&self, logical: u8) -> u8 {
        self.wire_bit
            .iter()
            .enumerate()
            .filter(|(bit, _)| logical & (1 << bit) != 0)
            .fold(0, |wire, (_, &target)| wire | (1 << target))
    }

    /// Translate a byte read from the device back into the logical value
    pub fn from_wire(&self, wire: u8) -> u8 {
        self.wire_bit
            .iter()
            .enumerate()
            .filter(|(_, target)| wire & (1 << **target) != 0)
            .fold(0, |logical, (bit, _)| logical | (1 << bit))
    }
}

pub fn map_segment_bits(logical: u8) -> u8 {
    BitPermutation::SEGMENTS.to_wire(logical)
}

pub fn unmap_segment_bits(wire: u8) -> u8 {
    BitPermutation::SEGMENTS.from_wire(wire)
}

pub fn map_bargraph_bits(logical: u8) -> u8 {
    BitPermutation::BARGRAPH.to_wire(logical)
}

pub fn unmap_bargraph_bits(wire: u8) -> u8 {
    BitPermutation::BARGRAPH.from_wire(wire)
}

/// Render a logical value as eight '0'/'1' characters, bit 7 leftmost
pub fn format_pattern(logical: u8) -> String {
    format!("{:08b}", logical)
}

/// Clamp a requested output value to the 8-bit pattern space
///
/// Values outside `0..=255` select the all-off pattern.
pub fn clamp_pattern(value: i64) -> u8 {
    u8::try_from(value).unwrap_or(0)
}

/// Parse attribute input the way `strtoul(buf, NULL, 10)` would
///
/// Leading whitespace and an optional sign are accepted, parsing stops at
/// the first non-digit, and input with no digits yields 0. Overlong numbers
/// saturate.
pub fn parse_decimal(input: &str) -> i64 {
    let trimmed = input.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let magnitude = digits
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .fold(0i64, |acc, b| {
            acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
        });

    if negative { -magnitude } else { magnitude }
}
