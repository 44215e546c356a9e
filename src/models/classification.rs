use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccessEvent;

/// Qualitative risk level attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// An event that matched the denylist or one of the rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(flatten)]
    pub event: AccessEvent,
    pub reason: String,
    pub severity: Severity,
    pub rule_id: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: usize,
}

/// Aggregate produced by one analysis pass over a log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub total_records: usize,
    /// Lines that were not blank but could not be parsed
    pub skipped_lines: usize,
    pub classifications: Vec<Classification>,
    /// Visits per actor, keyed by `email(id)`
    pub actor_stats: HashMap<String, usize>,
    pub domain_stats: HashMap<String, usize>,
    pub suspicious_actors: Vec<String>,
    pub top_domains: Vec<DomainCount>,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new() -> Self {
        AnalysisResult {
            total_records: 0,
            skipped_lines: 0,
            classifications: Vec::new(),
            actor_stats: HashMap::new(),
            domain_stats: HashMap::new(),
            suspicious_actors: Vec::new(),
            top_domains: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }

    pub fn malicious_count(&self) -> usize {
        self.classifications.len()
    }
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self::new()
    }
}
