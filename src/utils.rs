//! Small formatting/parsing helpers shared across the crawling runtime:
//! duration strings, and the retry-histogram dump alongside
//! [`crate::percentiles::PercentileStats::format`].

use std::str::FromStr;
use tokio::time::Duration;

/// Parses a duration string in the format "10m", "5h", "3d".
///
/// Supported units:
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let unit_char = s.chars().last().unwrap();
    let value_str = &s[0..s.len() - 1];

    let value = match u64::from_str(value_str) {
        Ok(v) => v,
        Err(_) => return Err(format!("Invalid numeric value in duration: '{}'", value_str)),
    };

    match unit_char {
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 60 * 60)),
        'd' => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "Unknown duration unit: '{}'. Use 'm', 'h', or 'd'.",
            unit_char
        )),
    }
}

/// Formats a retry histogram (`retry_histogram[k]` = count of requests whose
/// final attempt was the `(k+1)`-th) the way
/// [`crate::percentiles::PercentileStats::format`] formats percentiles: one
/// compact, grep-able line per report.
pub fn format_retry_histogram(histogram: &[u64]) -> String {
    if histogram.is_empty() {
        return "no requests finished or failed yet".to_string();
    }
    let total: u64 = histogram.iter().sum();
    let buckets: Vec<String> = histogram
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .map(|(attempt, count)| format!("attempt{}={}", attempt + 1, count))
        .collect();
    format!("total={}, {}", total, buckets.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes() {
        assert_eq!(parse_duration_string("10m").unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn parses_hours() {
        assert_eq!(parse_duration_string("5h").unwrap(), Duration::from_secs(5 * 3600));
    }

    #[test]
    fn parses_days() {
        assert_eq!(parse_duration_string("3d").unwrap(), Duration::from_secs(3 * 86400));
    }

    #[test]
    fn rejects_empty_string() {
        assert!(parse_duration_string("").is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration_string("10x").is_err());
    }

    #[test]
    fn rejects_non_numeric_value() {
        assert!(parse_duration_string("abcm").is_err());
    }

    #[test]
    fn empty_histogram_formats_as_no_requests_yet() {
        assert_eq!(format_retry_histogram(&[]), "no requests finished or failed yet");
    }

    #[test]
    fn histogram_formats_only_populated_buckets() {
        let formatted = format_retry_histogram(&[5, 0, 2]);
        assert_eq!(formatted, "total=7, attempt1=5, attempt3=2");
    }
}
