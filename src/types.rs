//! NewType wrappers for the opaque string fields that travel with a batch.
//!
//! These keep a country code from being passed where a network code is
//! expected, and give log lines a typed session label.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance without validation.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

newtype_string!(
    /// Mobile country code, exactly three digits (e.g. "001", "999").
    CountryCode
);

newtype_string!(
    /// Mobile network code, exactly two digits in this panel (e.g. "01", "70").
    NetworkCode
);

newtype_string!(
    /// Label attached to every relayed line of one session, e.g. "ue-0000000042".
    SessionLabel
);

impl CountryCode {
    pub const LEN: usize = 3;

    /// Validate and wrap a country code.
    pub fn parse(raw: &str) -> Option<Self> {
        is_digits_of_len(raw, Self::LEN).then(|| Self::new(raw))
    }
}

impl NetworkCode {
    pub const LEN: usize = 2;

    /// Validate and wrap a network code.
    pub fn parse(raw: &str) -> Option<Self> {
        is_digits_of_len(raw, Self::LEN).then(|| Self::new(raw))
    }
}

impl SessionLabel {
    /// Label for a session whose first identifier is `msin`.
    pub fn for_identifier(msin: impl fmt::Display) -> Self {
        Self(format!("ue-{msin}"))
    }
}

/// True when `raw` is exactly `len` ASCII digits.
pub fn is_digits_of_len(raw: &str, len: usize) -> bool {
    raw.len() == len && raw.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_code_requires_three_digits() {
        assert!(CountryCode::parse("001").is_some());
        assert!(CountryCode::parse("01").is_none());
        assert!(CountryCode::parse("0a1").is_none());
        assert!(CountryCode::parse("0011").is_none());
    }

    #[test]
    fn network_code_requires_two_digits() {
        assert_eq!(NetworkCode::parse("70").unwrap().as_str(), "70");
        assert!(NetworkCode::parse("7").is_none());
        assert!(NetworkCode::parse("-1").is_none());
    }

    #[test]
    fn session_label_format() {
        assert_eq!(
            SessionLabel::for_identifier("0000000042").as_str(),
            "ue-0000000042"
        );
    }

    #[test]
    fn serializes_transparently() {
        let code = CountryCode::new("999");
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"999\"");
    }
}
