use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request dispatched onto the work queue.
///
/// `id` is the correlation key; it must be unique among requests in flight at the same time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InquiryRequest {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub date: String,
    pub issued_at: DateTime<Utc>,
}

/// Result broadcast by a responder for one processed request.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InquiryResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub date: String,
    pub currency: String,
    pub amount: f64,
    pub produced_at: DateTime<Utc>,
}

/// Domain fields of a request, supplied by a [`PayloadGenerator`](crate::payload::PayloadGenerator).
#[derive(Clone, Debug, PartialEq)]
pub struct Subject {
    pub name: String,
    pub date: String,
}

/// Domain fields a responder synthesizes for a result.
#[derive(Clone, Debug, PartialEq)]
pub struct Quote {
    pub currency: String,
    pub amount: f64,
}

impl InquiryRequest {
    /// Creates a request stamped with the current time.
    pub fn new(id: impl Into<String>, subject: Subject) -> Self {
        InquiryRequest {
            id: id.into(),
            name: subject.name,
            date: subject.date,
            issued_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl InquiryResponse {
    /// Builds the result for `request`, stamped with `produced_at`.
    pub fn answer(request: &InquiryRequest, quote: Quote, produced_at: DateTime<Utc>) -> Self {
        InquiryResponse {
            id: request.id.clone(),
            name: request.name.clone(),
            date: request.date.clone(),
            currency: quote.currency,
            amount: quote.amount,
            produced_at,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Maximum age at which a request or result is still actionable.
///
/// A timestamp is fresh while `now - timestamp` is strictly less than the window.
/// Timestamps from the future count as fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StalenessWindow(Duration);

impl StalenessWindow {
    pub const DEFAULT: StalenessWindow = StalenessWindow(Duration::from_secs(10));

    pub fn new(window: Duration) -> Self {
        StalenessWindow(window)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn is_fresh_at(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - timestamp).to_std() {
            Ok(age) => age < self.0,
            // negative age
            Err(_) => true,
        }
    }

    pub fn is_fresh(&self, timestamp: DateTime<Utc>) -> bool {
        self.is_fresh_at(timestamp, Utc::now())
    }
}

impl Default for StalenessWindow {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn subject() -> Subject {
        Subject {
            name: "Ada Lovelace".to_string(),
            date: "1815-12-10".to_string(),
        }
    }

    #[test]
    fn request_survives_the_wire() {
        let request = InquiryRequest::new("u1", subject());
        let decoded = InquiryRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_survives_the_wire() {
        let request = InquiryRequest::new("u1", subject());
        let quote = Quote {
            currency: "EUR".to_string(),
            amount: 1520.25,
        };
        let response = InquiryResponse::answer(&request, quote, Utc::now());
        let decoded = InquiryResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn wire_format_uses_pascal_case_and_rfc3339() {
        let request = InquiryRequest::new("u1", subject());
        let value: serde_json::Value = serde_json::from_slice(&request.encode().unwrap()).unwrap();

        assert_eq!(value["ID"], "u1");
        assert_eq!(value["Name"], "Ada Lovelace");
        let issued_at = value["IssuedAt"].as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(issued_at).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), request.issued_at);
    }

    #[test]
    fn decodes_foreign_producer_payload() {
        let raw = br#"{"ID":"x","Name":"n","Date":"d","Currency":"USD","Amount":3.5,"ProducedAt":"2024-05-01T10:00:00.123456789+02:00"}"#;
        let response = InquiryResponse::decode(raw).unwrap();
        assert_eq!(response.id, "x");
        assert_eq!(response.amount, 3.5);
        assert_eq!(response.produced_at.to_rfc3339(), "2024-05-01T08:00:00.123456789+00:00");
    }

    #[test]
    fn answer_copies_correlation_fields() {
        let request = InquiryRequest::new("u9", subject());
        let now = Utc::now();
        let quote = Quote {
            currency: "JPY".to_string(),
            amount: 12.0,
        };
        let response = InquiryResponse::answer(&request, quote, now);
        assert_eq!(response.id, "u9");
        assert_eq!(response.name, request.name);
        assert_eq!(response.date, request.date);
        assert_eq!(response.produced_at, now);
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let window = StalenessWindow::new(Duration::from_secs(10));
        let now = Utc::now();

        assert!(window.is_fresh_at(now - TimeDelta::milliseconds(9_999), now));
        assert!(!window.is_fresh_at(now - TimeDelta::seconds(10), now));
        assert!(!window.is_fresh_at(now - TimeDelta::seconds(15), now));
    }

    #[test]
    fn future_timestamps_are_fresh() {
        let window = StalenessWindow::default();
        let now = Utc::now();
        assert!(window.is_fresh_at(now + TimeDelta::seconds(3), now));
        assert!(window.is_fresh_at(now, now));
    }
}
