//! Fixed-width decimal identifiers (MSIN) and their sequencing.
//!
//! An identifier keeps the width it was parsed with. Advancing it re-pads
//! with leading zeros, and a result that no longer fits the width is an
//! error rather than a silently longer string.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Widest identifier whose numeric value always fits in a `u64`.
pub const MAX_WIDTH: usize = 19;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier `{0}` is not a decimal number")]
    NotNumeric(String),

    #[error("identifier `{0}` is wider than {MAX_WIDTH} digits")]
    TooWide(String),

    #[error("identifier `{base}` + {offset} does not fit in {width} digits")]
    Overflow { base: String, offset: u64, width: usize },

    #[error("identifier space exhausted")]
    Exhausted,
}

/// A zero-padded decimal identifier of fixed width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msin {
    digits: String,
}

impl Msin {
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentifierError::NotNumeric(raw.to_string()));
        }
        if raw.len() > MAX_WIDTH {
            return Err(IdentifierError::TooWide(raw.to_string()));
        }
        Ok(Self {
            digits: raw.to_string(),
        })
    }

    pub fn width(&self) -> usize {
        self.digits.len()
    }

    pub fn value(&self) -> u64 {
        // Digits and width were checked in `parse`.
        self.digits.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.digits
    }

    /// Largest value representable in this identifier's width.
    fn max_value(&self) -> u64 {
        10u64
            .checked_pow(self.width() as u32)
            .map(|limit| limit - 1)
            .unwrap_or(u64::MAX)
    }

    /// The identifier `offset` positions after this one, same width.
    pub fn next(&self, offset: u64) -> Result<Self, IdentifierError> {
        let overflow = || IdentifierError::Overflow {
            base: self.digits.clone(),
            offset,
            width: self.width(),
        };

        let value = self.value().checked_add(offset).ok_or_else(overflow)?;
        if value > self.max_value() {
            return Err(overflow());
        }

        Ok(Self {
            digits: format!("{:0width$}", value, width = self.width()),
        })
    }

    /// `[self, self+1, ..., self+count-1]`.
    pub fn sequence(&self, count: u64) -> Result<Vec<Self>, IdentifierError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // Fail up front rather than half way through the batch.
        self.next(count - 1)?;
        (0..count).map(|offset| self.next(offset)).collect()
    }
}

/// String-level form of [`Msin::next`].
pub fn next_identifier(base: &str, offset: u64) -> Result<String, IdentifierError> {
    Ok(Msin::parse(base)?.next(offset)?.digits)
}

impl fmt::Display for Msin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digits)
    }
}

impl TryFrom<String> for Msin {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Msin> for String {
    fn from(msin: Msin) -> Self {
        msin.digits
    }
}

impl std::str::FromStr for Msin {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_keeps_width() {
        let base = Msin::parse("0000000001").unwrap();
        let next = base.next(41).unwrap();
        assert_eq!(next.as_str(), "0000000042");
        assert_eq!(next.width(), 10);
    }

    #[test]
    fn next_composes() {
        let base = Msin::parse("0000000120").unwrap();
        for (j, k) in [(0, 0), (1, 2), (7, 93), (999, 1)] {
            let stepwise = base.next(j).unwrap().next(k).unwrap();
            assert_eq!(stepwise, base.next(j + k).unwrap(), "j={j} k={k}");
        }
    }

    #[test]
    fn next_is_pure() {
        let base = Msin::parse("0099").unwrap();
        assert_eq!(base.next(1).unwrap(), base.next(1).unwrap());
        assert_eq!(base.as_str(), "0099");
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(
            Msin::parse("00000000a1"),
            Err(IdentifierError::NotNumeric("00000000a1".into()))
        );
        assert_eq!(Msin::parse(""), Err(IdentifierError::Empty));
        assert!(Msin::parse(" 123").is_err());
        assert!(Msin::parse("-123").is_err());
    }

    #[test]
    fn overflow_past_width_is_an_error() {
        let base = Msin::parse("9999999998").unwrap();
        assert_eq!(base.next(1).unwrap().as_str(), "9999999999");
        assert!(matches!(
            base.next(2),
            Err(IdentifierError::Overflow { width: 10, .. })
        ));
    }

    #[test]
    fn max_width_handles_u64_edge() {
        let base = Msin::parse("9999999999999999999").unwrap();
        assert!(base.next(1).is_err());
        assert!(Msin::parse("00000000000000000001").is_err());
    }

    #[test]
    fn sequence_has_no_gaps() {
        let base = Msin::parse("0000000001").unwrap();
        let seq: Vec<String> = base
            .sequence(3)
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(seq, ["0000000001", "0000000002", "0000000003"]);
        assert!(base.sequence(0).unwrap().is_empty());
    }

    #[test]
    fn sequence_fails_before_overflowing() {
        let base = Msin::parse("98").unwrap();
        assert!(base.sequence(2).is_ok());
        assert!(base.sequence(3).is_err());
    }

    #[test]
    fn string_helper_matches_type() {
        assert_eq!(next_identifier("0007", 5).unwrap(), "0012");
        assert!(next_identifier("NaN", 1).is_err());
    }

    #[test]
    fn deserializes_with_validation() {
        let ok: Msin = serde_json::from_str("\"0000000005\"").unwrap();
        assert_eq!(ok.value(), 5);
        assert!(serde_json::from_str::<Msin>("\"5x\"").is_err());
    }
}
