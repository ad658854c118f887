//! Utility functions for electkv

use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

/// Hostname of the machine this process runs on
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "electkv-node".to_string())
}

/// Validate one segment of a composite key (system name or hostname).
///
/// Segments must be non-empty, free of control characters and must not
/// contain `separator`.
pub fn validate_segment(segment: &str, separator: char) -> crate::Result<()> {
    if segment.is_empty() {
        return Err(crate::Error::InvalidKey("segment cannot be empty".into()));
    }

    if segment.contains(separator) {
        return Err(crate::Error::InvalidKey(format!(
            "segment {:?} contains separator {:?}",
            segment, separator
        )));
    }

    if segment.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidKey(format!(
            "segment {:?} contains invalid characters",
            segment
        )));
    }

    Ok(())
}
