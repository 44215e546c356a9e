use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AccessEvent;

pub const WELCOME_TEXT: &str = "urlscope real-time URL access feed";

/// One line on the real-time feed, discriminated by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Welcome { message: String, time: DateTime<Utc> },
    Heartbeat { time: DateTime<Utc> },
    UrlAccess { data: AccessEvent },
}

impl FeedMessage {
    pub fn welcome() -> Self {
        FeedMessage::Welcome {
            message: WELCOME_TEXT.to_string(),
            time: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        FeedMessage::Heartbeat { time: Utc::now() }
    }

    /// Serialize as a single newline terminated line
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
