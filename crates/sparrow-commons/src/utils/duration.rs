//! Duration fields in config files accept either a human-readable string
//! ("250ms", "30s", "5m", "1h") or a bare number of seconds.

use std::fmt;
use std::time::Duration;

use serde::de::{
    self,
    Visitor,
};
use serde::{
    Deserializer,
    Serializer,
};

/// Parse a duration string like "250ms", "30s", "5m" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num_str, suffix) = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, ""));

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {s}"))?;
    if num < 0.0 || !num.is_finite() {
        return Err(format!("invalid duration: {s}"));
    }

    let secs = match suffix.trim() {
        "ms" => return Ok(Duration::from_secs_f64(num / 1000.0)),
        "" | "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        other => return Err(format!("unknown duration suffix: {other}")),
    };

    Ok(Duration::from_secs_f64(secs))
}

/// Format a duration as the shortest exact human-readable string.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = millis / 1000;
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration string like \"30s\" or a number of seconds")
    }

    fn visit_str<E>(self, v: &str) -> Result<Duration, E>
    where
        E: de::Error,
    {
        parse_duration(v).map_err(E::custom)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom("negative duration"))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        if v < 0.0 || !v.is_finite() {
            return Err(E::custom("negative duration"));
        }
        Ok(Duration::from_secs_f64(v))
    }
}
