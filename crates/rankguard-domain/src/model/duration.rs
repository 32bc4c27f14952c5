//! Administrator time input such as `30d 15m 5s`.

use std::time::Duration;

/// Parses whitespace-separated `<amount><unit>` statements into a duration.
///
/// Supported units: `d`, `h`, `m`, `s`. Statements without an amount, with
/// an unknown unit, or with a non-numeric amount are skipped.
pub fn parse_duration_input(input: &str) -> Duration {
    input
        .split_whitespace()
        .filter_map(|statement| {
            let unit = statement.chars().next_back()?;
            let amount = &statement[..statement.len() - unit.len_utf8()];
            let unit_secs = match unit {
                'd' => 86_400,
                'h' => 3_600,
                'm' => 60,
                's' => 1,
                _ => return None,
            };
            let amount: u64 = amount.parse().ok()?;
            Some(Duration::from_secs(amount.saturating_mul(unit_secs)))
        })
        .fold(Duration::ZERO, |total, part| total.saturating_add(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_statements() {
        assert_eq!(parse_duration_input("30d"), Duration::from_secs(30 * 86_400));
        assert_eq!(parse_duration_input("2h"), Duration::from_secs(7_200));
        assert_eq!(parse_duration_input("15m"), Duration::from_secs(900));
        assert_eq!(parse_duration_input("5s"), Duration::from_secs(5));
    }

    #[test]
    fn test_multiple_statements_are_summed() {
        assert_eq!(
            parse_duration_input("30d 15m 5s"),
            Duration::from_secs(30 * 86_400 + 900 + 5)
        );
    }

    #[test]
    fn test_invalid_statements_are_skipped() {
        assert_eq!(parse_duration_input("d 5x 10s abcm"), Duration::from_secs(10));
        assert_eq!(parse_duration_input(""), Duration::ZERO);
    }

    #[test]
    fn test_multibyte_statements_are_skipped() {
        assert_eq!(parse_duration_input("10s 5é"), Duration::from_secs(10));
        assert_eq!(parse_duration_input("é 日 2h"), Duration::from_secs(7_200));
        assert_eq!(parse_duration_input("３s"), Duration::ZERO);
    }
}
