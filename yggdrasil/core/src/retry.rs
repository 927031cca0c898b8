use std::{fmt, str::FromStr};

/// The retry-on reasons Envoy accepts on a route retry policy.
const VALID_RETRY_ON: &[&str] = &[
    "5xx",
    "gateway-error",
    "reset",
    "connect-failure",
    "envoy-ratelimited",
    "retriable-4xx",
    "refused-stream",
    "retriable-status-codes",
    "retriable-headers",
    "http3-post-connect-failure",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryOnError {
    #[error("empty retry-on list")]
    Empty,

    #[error("unknown retry-on reason: {0:?}")]
    UnknownReason(String),
}

/// A validated comma-separated list of retry-on reasons, e.g.
/// `5xx,connect-failure`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy(String);

impl RetryPolicy {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RetryPolicy {
    type Err = RetryOnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RetryOnError::Empty);
        }
        for reason in s.split(',') {
            if !VALID_RETRY_ON.contains(&reason) {
                return Err(RetryOnError::UnknownReason(reason.to_string()));
            }
        }
        Ok(RetryPolicy(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_reasons() {
        for reason in VALID_RETRY_ON {
            assert!(reason.parse::<RetryPolicy>().is_ok(), "{reason}");
        }
        assert!("5xx,connect-failure,reset".parse::<RetryPolicy>().is_ok());
    }

    #[test]
    fn rejects_unknown_reasons() {
        assert_eq!(
            "5xx,flaky".parse::<RetryPolicy>(),
            Err(RetryOnError::UnknownReason("flaky".to_string()))
        );
        assert_eq!("".parse::<RetryPolicy>(), Err(RetryOnError::Empty));
        // whitespace is significant, as it is for Envoy itself
        assert!("5xx, reset".parse::<RetryPolicy>().is_err());
    }
}
