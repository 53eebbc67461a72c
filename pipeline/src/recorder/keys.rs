use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};

pub const TOKEN_SOURCE: &str = "{{SOURCE}}";
pub const TOKEN_DATE: &str = "{{DATE}}";
pub const TOKEN_TIME: &str = "{{TIME}}";
pub const TOKEN_PLATE: &str = "{{PLATE}}";
pub const TOKEN_CONFIDENCE: &str = "{{CONFIDENCE}}";

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn date_str(ms: i64) -> String {
    timestamp(ms).format("%Y-%m-%d").to_string()
}

fn time_str(ms: i64) -> String {
    timestamp(ms).format("%H-%M-%S-%3f").to_string()
}

/// Replace anything that could escape or confuse a path segment.
fn segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else {
        cleaned
    }
}

/// Path for one recorded plate image.
/// e.g. `./data/images/{{DATE}}/{{SOURCE}}/{{TIME}}_{{PLATE}}.jpeg` becomes
/// `./data/images/2023-11-14/driveway/22-13-20-123_ABC123.jpeg`
pub fn image_path(pattern: &str, source: &str, epoch_ms: i64, plate: &str, confidence: f64) -> PathBuf {
    let rendered = pattern
        .replace(TOKEN_SOURCE, &segment(source))
        .replace(TOKEN_DATE, &date_str(epoch_ms))
        .replace(TOKEN_TIME, &time_str(epoch_ms))
        .replace(TOKEN_PLATE, &segment(plate))
        .replace(TOKEN_CONFIDENCE, &format!("{:.0}", confidence));
    PathBuf::from(rendered)
}
