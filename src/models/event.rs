use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format of the human-readable `request_time` field.
pub const REQUEST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One request observed by the proxy.
///
/// The serialized field names are the on-disk and on-wire format shared by
/// the recorder, the real-time feed and the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "user_id", default)]
    pub actor_id: i64,
    #[serde(rename = "email", default)]
    pub actor_email: String,
    pub domain: String,
    #[serde(default)]
    pub full_url: Option<String>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub node_id: i64,
    #[serde(default)]
    pub node_tag: String,
    #[serde(default)]
    pub source_ip: String,
    #[serde(rename = "user_info", default)]
    pub extra_info: String,
    #[serde(default)]
    pub request_time: String,
}

impl AccessEvent {
    /// Create an event stamped with the current time
    pub fn new(actor_id: i64, actor_email: &str, domain: &str, protocol: &str) -> Self {
        Self::at(Utc::now(), actor_id, actor_email, domain, protocol)
    }

    /// Create an event with an explicit timestamp
    pub fn at(
        timestamp: DateTime<Utc>,
        actor_id: i64,
        actor_email: &str,
        domain: &str,
        protocol: &str,
    ) -> Self {
        AccessEvent {
            timestamp,
            actor_id,
            actor_email: actor_email.to_string(),
            domain: domain.to_string(),
            full_url: None,
            protocol: protocol.to_string(),
            node_id: 0,
            node_tag: String::new(),
            source_ip: String::new(),
            extra_info: String::new(),
            request_time: timestamp.format(REQUEST_TIME_FORMAT).to_string(),
        }
    }

    pub fn with_full_url(mut self, url: &str) -> Self {
        self.full_url = Some(url.to_string());
        self
    }

    pub fn with_node(mut self, node_id: i64, node_tag: &str) -> Self {
        self.node_id = node_id;
        self.node_tag = node_tag.to_string();
        self
    }

    pub fn with_source_ip(mut self, source_ip: &str) -> Self {
        self.source_ip = source_ip.to_string();
        self
    }

    pub fn with_extra_info(mut self, extra_info: &str) -> Self {
        self.extra_info = extra_info.to_string();
        self
    }

    /// Parse one persisted line.
    ///
    /// Lines without a timestamp or with an empty domain are rejected, so
    /// every event handed out carries the time it was actually recorded.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        Self::checked(serde_json::from_str(line)?)
    }

    /// Parse a line reported live by the proxy. A missing timestamp is
    /// taken as the time of receipt.
    pub fn from_reported_line(line: &str) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(line)?;
        if let Some(fields) = value.as_object_mut() {
            fields
                .entry("timestamp")
                .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));
        }
        Self::checked(serde_json::from_value(value)?)
    }

    fn checked(mut event: AccessEvent) -> Result<Self, serde_json::Error> {
        if event.domain.trim().is_empty() {
            return Err(serde::de::Error::custom("event has an empty domain"));
        }
        if event.request_time.is_empty() {
            event.request_time = event.timestamp.format(REQUEST_TIME_FORMAT).to_string();
        }
        Ok(event)
    }

    /// Key used to aggregate statistics per actor, e.g. `alice@example.com(42)`
    pub fn actor_key(&self) -> String {
        format!("{}({})", self.actor_email, self.actor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let event = AccessEvent::new(7, "bob@example.com", "example.org", "vmess")
            .with_full_url("https://example.org/login")
            .with_extra_info("vip");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["user_id"], 7);
        assert_eq!(value["email"], "bob@example.com");
        assert_eq!(value["full_url"], "https://example.org/login");
        assert_eq!(value["user_info"], "vip");
        assert!(value.get("actor_id").is_none());
    }

    #[test]
    fn test_parse_minimal_line() {
        let event = AccessEvent::from_json_line(
            r#"{"timestamp":"2024-03-01T10:00:00Z","user_id":3,"email":"c@d.e","domain":"foo.com"}"#,
        )
        .unwrap();
        assert_eq!(event.domain, "foo.com");
        assert_eq!(event.full_url, None);
        assert_eq!(event.request_time, "2024-03-01 10:00:00");
        assert_eq!(event.actor_key(), "c@d.e(3)");
    }

    #[test]
    fn test_parse_rejects_empty_domain() {
        assert!(AccessEvent::from_json_line(r#"{"user_id":1,"domain":"  "}"#).is_err());
        assert!(AccessEvent::from_json_line("not json").is_err());
    }

    #[test]
    fn test_persisted_line_requires_timestamp() {
        let line = r#"{"user_id":4,"email":"d@e.f","domain":"no-time.com"}"#;
        assert!(AccessEvent::from_json_line(line).is_err());

        let before = Utc::now();
        let reported = AccessEvent::from_reported_line(line).unwrap();
        assert!(reported.timestamp >= before);
        assert_eq!(reported.domain, "no-time.com");
        assert!(AccessEvent::from_reported_line(r#"{"user_id":4,"domain":""}"#).is_err());
    }
}
