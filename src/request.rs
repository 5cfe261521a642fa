//! Batch requests as they arrive over HTTP or the CLI, and their validation.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{PanelError, PanelResult};
use crate::identifier::Msin;
use crate::patcher::EndpointOverrides;
use crate::types::{CountryCode, NetworkCode};

/// Width every base identifier must have.
pub const IDENTIFIER_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    ImmediateBatch,
    ScheduledBatch,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImmediateBatch => "immediate-batch",
            Self::ScheduledBatch => "scheduled-batch",
        }
    }
}

/// A count that may arrive as a JSON number or as a form string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCount {
    Number(i64),
    Text(String),
}

impl From<i64> for RawCount {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl RawCount {
    /// An empty form field counts as absent.
    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }

    fn parse(&self, field: &str) -> PanelResult<i64> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| PanelError::validation(format!("{field} must be an integer"))),
        }
    }
}

/// Unvalidated start request. Accepted as JSON or `application/x-www-form-urlencoded`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub network_code: String,
    #[serde(default)]
    pub base_identifier: String,
    #[serde(default)]
    pub session_count: Option<RawCount>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub ues_per_session: Option<RawCount>,
    #[serde(default)]
    pub gnb_control_ip: Option<String>,
    #[serde(default)]
    pub gnb_data_ip: Option<String>,
    #[serde(default)]
    pub amf_ip: Option<String>,
}

/// Upper bounds applied during validation, taken from the panel config.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_session_count: u32,
    pub max_ues_per_session: u32,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_session_count: 100,
            max_ues_per_session: 1000,
        }
    }
}

/// A request that passed validation. Nothing has been touched yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub country: CountryCode,
    pub network: NetworkCode,
    pub base: Msin,
    pub session_count: u32,
    pub ues_per_session: u32,
    pub mode: RunMode,
    pub overrides: EndpointOverrides,
}

impl BatchRequest {
    pub fn validate(&self, limits: &BatchLimits) -> PanelResult<ValidatedBatch> {
        let country = CountryCode::parse(self.country_code.trim()).ok_or_else(|| {
            PanelError::validation(format!(
                "countryCode must be exactly {} digits",
                CountryCode::LEN
            ))
        })?;
        let network = NetworkCode::parse(self.network_code.trim()).ok_or_else(|| {
            PanelError::validation(format!(
                "networkCode must be exactly {} digits",
                NetworkCode::LEN
            ))
        })?;

        let raw_base = self.base_identifier.trim();
        if raw_base.len() != IDENTIFIER_WIDTH {
            return Err(PanelError::validation(format!(
                "baseIdentifier must be exactly {IDENTIFIER_WIDTH} digits"
            )));
        }
        let base = Msin::parse(raw_base)
            .map_err(|e| PanelError::validation(format!("baseIdentifier: {e}")))?;

        let session_count = bounded_count(
            self.session_count.as_ref(),
            "sessionCount",
            None,
            limits.max_session_count,
        )?;
        let ues_per_session = bounded_count(
            self.ues_per_session.as_ref(),
            "uesPerSession",
            Some(1),
            limits.max_ues_per_session,
        )?;

        if self.run_mode == RunMode::ImmediateBatch {
            let consumed = u64::from(session_count) * u64::from(ues_per_session);
            base.next(consumed - 1)?;
        }

        let overrides = EndpointOverrides {
            gnb_control_ip: parse_ip(self.gnb_control_ip.as_deref(), "gnbControlIp")?,
            gnb_data_ip: parse_ip(self.gnb_data_ip.as_deref(), "gnbDataIp")?,
            amf_ip: parse_ip(self.amf_ip.as_deref(), "amfIp")?,
        };

        Ok(ValidatedBatch {
            country,
            network,
            base,
            session_count,
            ues_per_session,
            mode: self.run_mode,
            overrides,
        })
    }
}

fn bounded_count(
    raw: Option<&RawCount>,
    field: &str,
    default: Option<u32>,
    max: u32,
) -> PanelResult<u32> {
    let value = match (raw.filter(|r| !r.is_blank()), default) {
        (Some(raw), _) => raw.parse(field)?,
        (None, Some(default)) => i64::from(default),
        (None, None) => return Err(PanelError::validation(format!("{field} is required"))),
    };
    if value < 1 || value > i64::from(max) {
        return Err(PanelError::validation(format!(
            "{field} must be between 1 and {max}"
        )));
    }
    Ok(value as u32)
}

fn parse_ip(raw: Option<&str>, field: &str) -> PanelResult<Option<String>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<IpAddr>()
            .map(|ip| Some(ip.to_string()))
            .map_err(|_| PanelError::validation(format!("{field} is not an IP address"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BatchRequest {
        BatchRequest {
            country_code: "001".into(),
            network_code: "01".into(),
            base_identifier: "0000000001".into(),
            session_count: Some(3.into()),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_valid_request() {
        let batch = request().validate(&BatchLimits::default()).unwrap();
        assert_eq!(batch.base.as_str(), "0000000001");
        assert_eq!(batch.session_count, 3);
        assert_eq!(batch.ues_per_session, 1);
        assert_eq!(batch.mode, RunMode::ImmediateBatch);
    }

    #[test]
    fn rejects_zero_sessions() {
        let mut req = request();
        req.session_count = Some(0.into());
        let err = req.validate(&BatchLimits::default()).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn rejects_sessions_over_limit() {
        let mut req = request();
        req.session_count = Some(101.into());
        assert!(req.validate(&BatchLimits::default()).is_err());

        let limits = BatchLimits {
            max_session_count: 100_000,
            ..Default::default()
        };
        assert!(req.validate(&limits).is_ok());
    }

    #[test]
    fn rejects_non_numeric_identifier() {
        let mut req = request();
        req.base_identifier = "00000abc01".into();
        let err = req.validate(&BatchLimits::default()).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn rejects_wrong_width_identifier() {
        let mut req = request();
        req.base_identifier = "123".into();
        assert!(req.validate(&BatchLimits::default()).is_err());
    }

    #[test]
    fn rejects_bad_prefix_fields() {
        let mut req = request();
        req.country_code = "1".into();
        assert!(req.validate(&BatchLimits::default()).is_err());

        let mut req = request();
        req.network_code = "abc".into();
        assert!(req.validate(&BatchLimits::default()).is_err());
    }

    #[test]
    fn rejects_batch_that_overflows_width() {
        let mut req = request();
        req.base_identifier = "9999999999".into();
        req.session_count = Some(2.into());
        let err = req.validate(&BatchLimits::default()).unwrap_err();
        assert_eq!(err.kind(), "InvalidIdentifier");
    }

    #[test]
    fn parses_form_style_counts() {
        let mut req = request();
        req.session_count = Some(RawCount::Text(" 5 ".into()));
        req.ues_per_session = Some(RawCount::Text("4".into()));
        let batch = req.validate(&BatchLimits::default()).unwrap();
        assert_eq!(batch.session_count, 5);
        assert_eq!(batch.ues_per_session, 4);

        req.session_count = Some(RawCount::Text("five".into()));
        assert!(req.validate(&BatchLimits::default()).is_err());
    }

    #[test]
    fn validates_overrides() {
        let mut req = request();
        req.amf_ip = Some("10.0.0.5".into());
        req.gnb_control_ip = Some("".into());
        let batch = req.validate(&BatchLimits::default()).unwrap();
        assert_eq!(batch.overrides.amf_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(batch.overrides.gnb_control_ip, None);

        req.amf_ip = Some("not-an-ip".into());
        assert!(req.validate(&BatchLimits::default()).is_err());
    }

    #[test]
    fn deserializes_json_camel_case() {
        let req: BatchRequest = serde_json::from_value(serde_json::json!({
            "countryCode": "001",
            "networkCode": "01",
            "baseIdentifier": "0000000001",
            "sessionCount": 3,
            "runMode": "scheduled-batch"
        }))
        .unwrap();
        assert_eq!(req.run_mode, RunMode::ScheduledBatch);
        assert_eq!(req.session_count, Some(RawCount::Number(3)));
    }
}
