use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line read from a tailed file, addressed to a bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub topic: String,
    pub path: String,
    pub line: String,
    pub collected_at: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(topic: impl Into<String>, path: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            path: path.into(),
            line: line.into(),
            collected_at: Utc::now(),
        }
    }
}
