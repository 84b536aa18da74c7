use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;
use tokio::time::Instant;

/// About thirty years, used instead of instants that cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Parses durations written in humantime format (`2h`, `3m 10s`, `150ms`).
pub fn parse_human_time(text: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(text)
        .map_err(|e| anyhow::anyhow!("Could not parse duration `{text}`: {e}"))
}

pub fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    parse_human_time(&buf).map_err(serde::de::Error::custom)
}

pub fn serialize_human_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Reads a duration in milliseconds from an environment variable.
pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// `instant + duration`, capped to [`FAR_FUTURE`] when the sum overflows.
pub fn saturating_add(instant: Instant, duration: Duration) -> Instant {
    instant
        .checked_add(duration)
        .or_else(|| instant.checked_add(FAR_FUTURE))
        .unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::{FAR_FUTURE, parse_human_time, saturating_add};
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn saturating_instant_addition() {
        let now = Instant::now();
        assert_eq!(
            saturating_add(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        assert_eq!(saturating_add(now, Duration::MAX), now + FAR_FUTURE);
        let huge = parse_human_time("1000000years").unwrap();
        assert!(saturating_add(now, huge) > now);
    }

    #[test]
    fn parse_human_durations() {
        assert_eq!(parse_human_time("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(
            parse_human_time("1m 30s").unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_human_time("150ms").unwrap(),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn parse_human_duration_error() {
        assert!(parse_human_time("soon").is_err());
    }
}
