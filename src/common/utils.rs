//! Utility functions for tpckv

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "250ms", "30s", "5m", "1h")
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

    let scaled = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => scaled(60),
        "h" => scaled(3600),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

/// Serde adapter for durations written as human strings in config files.
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Retry until success, doubling the delay up to `max_delay`.
///
/// Every error is retried; callers decide what counts as success.
pub async fn retry_forever<F, Fut, T>(mut f: F, initial_delay: Duration, max_delay: Duration) -> T
where
    F: FnMut(u64) -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0u64;

    loop {
        match f(attempt).await {
            Ok(result) => return result,
            Err(e) => {
                tracing::warn!(
                    "Attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                attempt += 1;
            }
        }
    }
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Render a key for logs: UTF-8 when printable, hex otherwise.
pub fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if !s.chars().any(|c| c.is_control()) => s.to_string(),
        _ => key.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        let huge = format!("{}h", u64::MAX / 60);
        assert!(matches!(parse_duration(&huge), Err(crate::Error::InvalidConfig(_))));
        assert!(matches!(
            parse_duration(&format!("{}m", u64::MAX)),
            Err(crate::Error::InvalidConfig(_))
        ));
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_display_key() {
        assert_eq!(display_key(b"user:42"), "user:42");
        assert_eq!(display_key(&[0x00, 0xff]), "00ff");
    }

    #[tokio::test]
    async fn test_retry_forever_eventually_succeeds() {
        let value = retry_forever(
            |attempt| async move {
                if attempt < 2 {
                    Err(crate::Error::Network("down".into()))
                } else {
                    Ok(attempt)
                }
            },
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
        .await;
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up_on_fatal() {
        let mut calls = 0;
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls += 1;
                async { Err(crate::Error::Protocol("nope".into())) }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
