use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time as ISO-8601 with millisecond precision
/// (`2024-05-01T12:30:00.123Z`).
pub fn timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Format `at` the same way as [`timestamp`].
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Filename-safe variant of [`timestamp`]: `:` and `.` become `-`.
pub fn backup_stamp() -> String {
    file_safe(&timestamp())
}

fn file_safe(stamp: &str) -> String {
    stamp.replace([':', '.'], "-")
}
