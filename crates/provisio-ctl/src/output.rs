//! Plain-text formatting helpers for task listings.

/// Truncate to `max` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max || max == 0 {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max - 1).collect::<String>())
    }
}

/// Render `ts` relative to `now`, e.g. `in 4m 10s` or `2h 5m ago`.
pub fn relative(ts: i64, now: i64) -> String {
    let delta = ts - now;
    if delta == 0 {
        return "now".to_string();
    }
    let span = span(delta.unsigned_abs());
    if delta > 0 {
        format!("in {span}")
    } else {
        format!("{span} ago")
    }
}

fn span(secs: u64) -> String {
    let (d, h, m, s) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    match (d, h, m) {
        (0, 0, 0) => format!("{s}s"),
        (0, 0, _) => format!("{m}m {s}s"),
        (0, _, _) => format!("{h}h {m}m"),
        _ => format!("{d}d {h}h"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("alice", 10), "alice");
        assert_eq!(truncate("ssh-ed25519 AAAA", 8), "ssh-ed2…");
    }

    #[test]
    fn relative_times() {
        assert_eq!(relative(100, 100), "now");
        assert_eq!(relative(400, 100), "in 5m 0s");
        assert_eq!(relative(100, 145), "45s ago");
        assert_eq!(relative(0, 7_500), "2h 5m ago");
        assert_eq!(relative(200_000, 0), "in 2d 7h");
    }
}
