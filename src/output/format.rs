//! Fixed-width rendering of durations for the result table.

use std::time::Duration;

const UNITS: [(u128, &str); 4] = [
    (1, "ns"),
    (1_000, "µs"),
    (1_000_000, "ms"),
    (1_000_000_000, "s"),
];

/// `"  1.23 ms"`: unit picked by magnitude, integer part right-aligned to three
/// columns, two fractional digits truncated (not rounded).
pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    let (scale, unit) = UNITS
        .iter()
        .rev()
        .find(|(scale, _)| ns >= *scale)
        .copied()
        .unwrap_or(UNITS[0]);
    let whole = ns / scale;
    let frac = (ns % scale) * 100 / scale;
    format!("{:>3}.{:02} {}", whole, frac, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_unit_by_magnitude() {
        assert_eq!(format_duration(Duration::ZERO), "  0.00 ns");
        assert_eq!(format_duration(Duration::from_nanos(500)), "500.00 ns");
        assert_eq!(format_duration(Duration::from_nanos(12_345)), " 12.34 µs");
        assert_eq!(format_duration(Duration::from_micros(1_234)), "  1.23 ms");
        assert_eq!(format_duration(Duration::from_millis(48)), " 48.00 ms");
        assert_eq!(format_duration(Duration::from_micros(49_600)), " 49.60 ms");
        assert_eq!(format_duration(Duration::from_millis(2_500)), "  2.50 s");
    }

    #[test]
    fn truncates_instead_of_rounding() {
        assert_eq!(format_duration(Duration::from_nanos(2_989_999)), "  2.98 ms");
        assert_eq!(format_duration(Duration::from_nanos(999_999)), "999.99 µs");
    }

    #[test]
    fn long_durations_widen_the_integer_part() {
        assert_eq!(format_duration(Duration::from_secs(1234)), "1234.00 s");
    }
}
