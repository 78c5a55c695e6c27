use chrono::{DateTime, Utc};

// Stamped by build.rs; absent only in odd builds (e.g. rust-analyzer).
const BUILD_EPOCH: Option<&str> = option_env!("PROCWATCH_BUILD_EPOCH");
const BUILD_HOST: Option<&str> = option_env!("PROCWATCH_BUILD_HOST");

pub fn build_host() -> &'static str {
    BUILD_HOST.unwrap_or("unknown")
}

/// Build time as seconds since the epoch, if the stamp is usable.
pub fn build_epoch() -> Option<i64> {
    BUILD_EPOCH.and_then(|s| s.trim().parse().ok())
}

/// Build time rendered as UTC `YYYY-MM-DD HH:MM:SS`, stable across
/// environments.
pub fn build_time_pretty() -> String {
    build_epoch()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn banner() -> String {
    format!("procwatch built {} on {}", build_time_pretty(), build_host())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_the_stamp() {
        // build.rs always emits both stamps, so neither side can be blank.
        let b = banner();
        assert!(b.starts_with("procwatch built "), "{b}");
        assert!(!b.contains("built  on"), "{b}");
    }

    #[test]
    fn epoch_renders_as_utc() {
        if let Some(secs) = build_epoch() {
            assert!(secs > 0);
            assert!(build_time_pretty().contains('-'));
        }
    }
}
