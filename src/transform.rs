//! Boundary to the component that interprets message text.
//!
//! The queue processor only needs to know whether a message was accepted. Anything the
//! transform creates from it (encounters, observations, ...) is opaque and summarized by
//! [`DomainEffects`].

use std::{future::Future, pin::Pin};

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use snafu::Snafu;

use crate::timestamp;

/// What a successful transform produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainEffects {
    /// Message type and trigger event, e.g. `ORU^R01`
    pub message_type: Option<String>,
    /// MSH-10 message control id
    pub control_id: Option<String>,
    /// MSH-7, normalized
    pub sent_at: Option<DateTime<FixedOffset>>,
    pub segments: usize,
}

/// A message the transform refused. Becomes an error record.
#[derive(Debug, Snafu)]
#[snafu(display("{summary}"))]
pub struct TransformError {
    /// Short label shown in listings
    pub summary: String,
    /// Free-text explanation kept for operator review
    pub detail: String,
}

impl TransformError {
    pub fn new(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

/// Interprets the text of a queue item.
///
/// Implementations must be safe to share between the scheduled drain and on-demand
/// triggers. A returned [`TransformError`] routes the item to the error collection; the
/// processor never retries it.
pub trait MessageTransform: Send + Sync + 'static {
    fn transform<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DomainEffects, TransformError>> + Send + 'a>>;

    /// Drops whatever the transform caches between messages. Called periodically while
    /// draining.
    fn release_resources(&self) {}
}

/// Structural check of the MSH header segment.
///
/// Accepts a message when it starts with a well-formed MSH segment, carries a message
/// type, uses a supported version and has a valid MSH-7 timestamp (if any). It does not
/// look past the header.
#[derive(Debug, Clone)]
pub struct MshHeaderTransform {
    versions: Vec<String>,
    message_types: Option<Vec<String>>,
}

impl Default for MshHeaderTransform {
    fn default() -> Self {
        Self {
            versions: vec!["2.5".to_owned()],
            message_types: None,
        }
    }
}

impl MshHeaderTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts accepted message types, e.g. `["ORU^R01"]`.
    pub fn with_message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn inspect(&self, payload: &str) -> Result<DomainEffects, TransformError> {
        let mut segments = payload
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let header = segments
            .next()
            .ok_or_else(|| TransformError::new("Error parsing message", "empty message"))?;

        if !header.starts_with("MSH") || header.len() < 8 {
            return Err(TransformError::new(
                "Error parsing message",
                "message does not start with an MSH segment",
            ));
        }

        let Some(separator) = header[3..].chars().next() else {
            return Err(TransformError::new(
                "Error parsing message",
                "missing field separator",
            ));
        };
        if separator.is_alphanumeric() {
            return Err(TransformError::new(
                "Error parsing message",
                format!("invalid field separator {separator:?}"),
            ));
        }

        // fields[n] is MSH-(n + 1), MSH-1 being the separator itself
        let fields: Vec<&str> = header.split(separator).collect();
        let field = |n: usize| fields.get(n - 1).copied().filter(|f| !f.is_empty());

        let component = field(2)
            .and_then(|enc| enc.chars().next())
            .unwrap_or('^');

        let message_type = field(9)
            .ok_or_else(|| TransformError::new("Error parsing message", "missing MSH-9"))?;

        if let Some(types) = &self.message_types {
            if !types.iter().any(|t| t == message_type) {
                return Err(TransformError::new(
                    format!("Message type not supported: \"{message_type}\""),
                    format!("supported message types: {}", types.join(", ")),
                ));
            }
        }

        let version = field(12)
            .and_then(|v| v.split(component).next())
            .unwrap_or_default();
        if !self.versions.iter().any(|v| v == version) {
            return Err(TransformError::new(
                format!("Unsupported version \"{version}\""),
                format!("supported versions: {}", self.versions.join(", ")),
            ));
        }

        let sent_at = field(7)
            .map(|ts| ts.split(component).next().unwrap_or(ts))
            .map(timestamp::parse_timestamp)
            .transpose()
            .map_err(|e| TransformError::new("Invalid message timestamp (MSH-7)", e.to_string()))?;

        Ok(DomainEffects {
            message_type: Some(message_type.to_owned()),
            control_id: field(10).map(str::to_owned),
            sent_at,
            segments: 1 + segments.count(),
        })
    }
}

impl MessageTransform for MshHeaderTransform {
    fn transform<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DomainEffects, TransformError>> + Send + 'a>> {
        Box::pin(std::future::ready(self.inspect(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORU: &str = "MSH|^~\\&|FORMENTRY|AMRS.ELD|HL7LISTENER|AMRS.ELD|20080226102656||ORU^R01|JqnfhKKtouEz8kzTk6Zo|P|2.5|1||||||||16^AMRS.ELD.FORMID\r\
        PID|||3^^^^||John3^Doe^||\r\
        PV1||O|1^Unknown Location||||1^Super User (1-8)|||||||||||||||||||||||||||||||||||||20080212|||||||V\r\
        ORC|RE||||||||20080226102537|1^Super User\r\
        OBR|1|||1238^MEDICAL RECORD OBSERVATIONS^99DCT\r\
        OBX|1|NM|5497^CD4, BY FACS^99DCT||450|||||||||20080206";

    #[tokio::test]
    async fn test_accepts_oru_header() {
        let effects = MshHeaderTransform::new().transform(ORU).await.unwrap();

        assert_eq!(effects.message_type.as_deref(), Some("ORU^R01"));
        assert_eq!(effects.control_id.as_deref(), Some("JqnfhKKtouEz8kzTk6Zo"));
        assert_eq!(effects.segments, 6);
        assert!(effects.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_rejects_unsupported_version() {
        let payload = ORU.replacen("|2.5|", "|2.3|", 1);
        let err = MshHeaderTransform::new()
            .transform(&payload)
            .await
            .unwrap_err();

        assert_eq!(err.summary, "Unsupported version \"2.3\"");
    }

    #[tokio::test]
    async fn test_rejects_unlisted_message_type() {
        let err = MshHeaderTransform::new()
            .with_message_types(["ADT^A04"])
            .transform(ORU)
            .await
            .unwrap_err();

        assert!(err.summary.contains("ORU^R01"));
    }

    #[tokio::test]
    async fn test_malformed_timestamp_is_a_transform_error() {
        let payload = ORU.replacen("20080226102656", "2008022610265", 1);
        let err = MshHeaderTransform::new()
            .transform(&payload)
            .await
            .unwrap_err();

        assert_eq!(err.summary, "Invalid message timestamp (MSH-7)");
        assert!(err.detail.contains("2008022610265"));
    }

    #[tokio::test]
    async fn test_rejects_non_hl7_payload() {
        let transform = MshHeaderTransform::new();

        for payload in ["", "PID|||3", "MSH"] {
            let err = transform.transform(payload).await.unwrap_err();
            assert_eq!(err.summary, "Error parsing message");
        }
    }
}
