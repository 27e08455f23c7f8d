use once_cell::sync::Lazy;
use regex::Regex;
use std::{str::FromStr, time::Duration};

/// A non-negative duration flag in Go syntax, e.g. `15m`, `500ms` or `1h30m`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlagDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("durations must not be negative")]
    Negative,

    #[error("missing a unit in {0:?}")]
    NoUnit(String),

    #[error("unknown unit {0:?}, expected one of ns, us, ms, s, m or h")]
    InvalidUnit(String),

    #[error("invalid number in {0:?}")]
    NotANumber(String),
}

static COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d*)?|\.\d+)([a-zµμ]+)").expect("duration pattern must compile")
});

fn unit_nanos(unit: &str) -> Option<f64> {
    let nanos = match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return None,
    };
    Some(nanos)
}

impl From<Duration> for FlagDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<FlagDuration> for Duration {
    fn from(FlagDuration(duration): FlagDuration) -> Self {
        duration
    }
}

impl FromStr for FlagDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        if s == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut nanos = 0.0;
        let mut rest = s;
        while !rest.is_empty() {
            let Some(caps) = COMPONENT.captures(rest) else {
                if rest.chars().all(|c| c.is_ascii_digit() || c == '.') {
                    return Err(ParseError::NoUnit(s.to_string()));
                }
                return Err(ParseError::NotANumber(s.to_string()));
            };
            let value = caps[1]
                .parse::<f64>()
                .map_err(|_| ParseError::NotANumber(s.to_string()))?;
            let unit =
                unit_nanos(&caps[2]).ok_or_else(|| ParseError::InvalidUnit(caps[2].to_string()))?;
            nanos += value * unit;
            rest = &rest[caps[0].len()..];
        }

        Ok(Self(Duration::from_nanos(nanos.round() as u64)))
    }
}
