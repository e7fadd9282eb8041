use chrono::Duration;
use std::collections::BTreeMap;

/// Render an age the way `kubectl get` does: the largest whole unit only.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    if duration.num_days() > 0 {
        format!("{}d", duration.num_days())
    } else if duration.num_hours() > 0 {
        format!("{}h", duration.num_hours())
    } else if duration.num_minutes() > 0 {
        format!("{}m", duration.num_minutes())
    } else {
        format!("{}s", duration.num_seconds())
    }
}

pub(crate) fn format_label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(",")
}

/// Parse `key=value` pairs as accepted on the command line.
///
/// Returns `None` if any pair lacks an `=`.
#[must_use]
pub fn parse_label_pairs<S: AsRef<str>>(pairs: &[S]) -> Option<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|p| {
            p.as_ref()
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
