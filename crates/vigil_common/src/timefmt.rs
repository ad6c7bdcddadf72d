//! Human-readable time and size formatting for prompt text, plus the
//! nanosecond serde representation used for durations on disk.

use chrono::Duration;

/// "just now", "5 minutes", "3 hours", "2 days". Used for "(... ago)"
/// suffixes in change summaries.
pub fn format_ago(d: Duration) -> String {
    if d < Duration::minutes(1) {
        return "just now".to_string();
    }
    if d < Duration::hours(1) {
        return format_unit(d.num_minutes(), "minute");
    }
    if d < Duration::days(1) {
        return format_unit(d.num_hours(), "hour");
    }
    format_unit(d.num_days(), "day")
}

/// "seconds", "1 minute", "10 minutes", "2 hours". Used for correlation
/// delay descriptions.
pub fn format_span(d: Duration) -> String {
    if d < Duration::minutes(1) {
        return "seconds".to_string();
    }
    if d < Duration::hours(1) {
        return format_unit(d.num_minutes(), "minute");
    }
    format_unit(d.num_hours(), "hour")
}

/// Compact form: "45s", "3m", "2h10m", "1d4h". Used in dense timeline lines.
pub fn format_compact(d: Duration) -> String {
    if d < Duration::minutes(1) {
        return format!("{}s", d.num_seconds());
    }
    if d < Duration::hours(1) {
        return format!("{}m", d.num_minutes());
    }
    if d < Duration::days(1) {
        let hours = d.num_hours();
        let mins = d.num_minutes() % 60;
        if mins > 0 {
            return format!("{hours}h{mins}m");
        }
        return format!("{hours}h");
    }
    let days = d.num_days();
    let hours = d.num_hours() % 24;
    if hours > 0 {
        return format!("{days}d{hours}h");
    }
    format!("{days}d")
}

/// "less than an hour", "6 hours", "1 day", "12 days". Used in prediction
/// basis strings where the interval is a fractional day count.
pub fn format_days(days: f64) -> String {
    if days < 1.0 {
        let hours = days * 24.0;
        if hours < 1.0 {
            return "less than an hour".to_string();
        }
        return format!("{} hours", hours as i64);
    }
    if days < 2.0 {
        return "1 day".to_string();
    }
    format!("{} days", days as i64)
}

fn format_unit(n: i64, unit: &str) -> String {
    if n == 1 {
        return format!("1 {unit}");
    }
    format!("{n} {unit}s")
}

/// "1.5 GB", "512 MB", "2 KB", "100 B". Fraction digit is truncated, not
/// rounded, and dropped when zero.
pub fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{} GB", format_float(bytes as f64 / GB as f64))
    } else if bytes >= MB {
        format!("{} MB", format_float(bytes as f64 / MB as f64))
    } else if bytes >= KB {
        format!("{} KB", format_float(bytes as f64 / KB as f64))
    } else {
        format!("{bytes} B")
    }
}

fn format_float(v: f64) -> String {
    let whole = v as i64;
    let frac = ((v - whole as f64) * 10.0) as i64;
    if frac == 0 {
        return whole.to_string();
    }
    format!("{whole}.{frac}")
}

/// "85%" from a confidence in [0, 1].
pub fn format_confidence(c: f64) -> String {
    format!("{}%", (c * 100.0) as i64)
}

/// Serde adapter storing `chrono::Duration` as an integer nanosecond count,
/// the on-disk representation for all duration fields.
pub mod duration_ns {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(d.num_nanoseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ns = i64::deserialize(de)?;
        Ok(Duration::nanoseconds(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ago_buckets() {
        assert_eq!(format_ago(Duration::seconds(30)), "just now");
        assert_eq!(format_ago(Duration::minutes(1)), "1 minute");
        assert_eq!(format_ago(Duration::minutes(15)), "15 minutes");
        assert_eq!(format_ago(Duration::hours(3)), "3 hours");
        assert_eq!(format_ago(Duration::days(2)), "2 days");
    }

    #[test]
    fn span_buckets() {
        assert_eq!(format_span(Duration::seconds(45)), "seconds");
        assert_eq!(format_span(Duration::minutes(10)), "10 minutes");
        assert_eq!(format_span(Duration::hours(2)), "2 hours");
    }

    #[test]
    fn compact_buckets() {
        assert_eq!(format_compact(Duration::seconds(45)), "45s");
        assert_eq!(format_compact(Duration::minutes(3)), "3m");
        assert_eq!(format_compact(Duration::minutes(130)), "2h10m");
        assert_eq!(format_compact(Duration::hours(28)), "1d4h");
        assert_eq!(format_compact(Duration::days(3)), "3d");
    }

    #[test]
    fn day_buckets() {
        assert_eq!(format_days(0.02), "less than an hour");
        assert_eq!(format_days(0.25), "6 hours");
        assert_eq!(format_days(1.5), "1 day");
        assert_eq!(format_days(12.8), "12 days");
    }

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(100), "100 B");
        assert_eq!(format_bytes(2048), "2 KB");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1.5 GB");
    }

    #[test]
    fn confidence_percent() {
        assert_eq!(format_confidence(0.85), "85%");
        assert_eq!(format_confidence(0.0), "0%");
    }

    #[test]
    fn duration_round_trips_as_nanos() {
        use serde::{Deserialize, Serialize};

        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_ns")]
            delay: Duration,
        }

        let w = Wrapper {
            delay: Duration::seconds(90),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"delay":90000000000}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.delay, w.delay);
    }
}
