//! Domain classification rules
//!
//! Rules are kept in an ordered list and evaluated front to back. The
//! denylist is always the first entry, so an exact denylist hit wins over
//! every pattern rule. Among pattern rules the earliest registered match
//! wins, regardless of severity.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Severity;

/// Rule id reported for denylist matches
pub const DENYLIST_RULE_ID: &str = "malicious_domain_list";

/// Reason reported for denylist matches
pub const DENYLIST_REASON: &str = "Domain is on the malicious domain list";

/// How a rule decides whether a domain matches
#[derive(Debug, Clone)]
pub enum DomainMatcher {
    /// Exact match against a set of known-bad domains
    Denylist(HashSet<String>),
    /// Unanchored regular expression search
    Pattern(Regex),
}

impl DomainMatcher {
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Denylist(domains) => domains.contains(domain),
            DomainMatcher::Pattern(regex) => regex.is_match(domain),
        }
    }
}

/// A named, orderable classifier
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub enabled: bool,
    pub matcher: DomainMatcher,
}

impl Rule {
    /// The denylist rule with an empty domain set
    pub fn denylist() -> Self {
        Rule {
            id: DENYLIST_RULE_ID.to_string(),
            name: "Malicious domain list".to_string(),
            description: DENYLIST_REASON.to_string(),
            severity: Severity::High,
            enabled: true,
            matcher: DomainMatcher::Denylist(HashSet::new()),
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        self.enabled && self.matcher.matches(domain)
    }

    /// Pattern source, if this is a pattern rule
    pub fn pattern(&self) -> Option<&str> {
        match &self.matcher {
            DomainMatcher::Pattern(regex) => Some(regex.as_str()),
            DomainMatcher::Denylist(_) => None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Uncompiled rule, as written in configuration or passed by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub pattern: String,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleDefinition {
    pub fn new(id: &str, description: &str, pattern: &str, severity: Severity) -> Self {
        RuleDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: description.to_string(),
            pattern: pattern.to_string(),
            severity,
            enabled: true,
        }
    }

    /// Compile the pattern into a rule
    pub fn compile(&self) -> Result<Rule, regex::Error> {
        let regex = Regex::new(&self.pattern)?;
        Ok(Rule {
            id: self.id.clone(),
            name: if self.name.is_empty() { self.id.clone() } else { self.name.clone() },
            description: self.description.clone(),
            severity: self.severity,
            enabled: self.enabled,
            matcher: DomainMatcher::Pattern(regex),
        })
    }
}

/// Rules loaded into every new analyzer, in evaluation order
pub fn builtin_rules() -> Vec<RuleDefinition> {
    vec![
        RuleDefinition {
            id: "malware_domain".to_string(),
            name: "Malware domain".to_string(),
            description: "Known malware, virus, trojan, botnet or phishing domain".to_string(),
            pattern: r"(malware|virus|trojan|botnet|phishing)\..*".to_string(),
            severity: Severity::High,
            enabled: true,
        },
        RuleDefinition {
            id: "suspicious_tld".to_string(),
            name: "Suspicious TLD".to_string(),
            description: "Domain under a frequently abused free top-level domain".to_string(),
            pattern: r".*\.(tk|ml|ga|cf|gq)$".to_string(),
            severity: Severity::Medium,
            enabled: true,
        },
        RuleDefinition {
            id: "tor_exit_node".to_string(),
            name: "Tor hidden service".to_string(),
            description: "Tor network address".to_string(),
            pattern: r".*\.onion$".to_string(),
            severity: Severity::Medium,
            enabled: true,
        },
        RuleDefinition {
            id: "suspicious_subdomain".to_string(),
            name: "Suspicious subdomain".to_string(),
            description: "Credential-themed subdomain on a suspicious TLD".to_string(),
            pattern: r"(admin|login|secure|bank|pay|account)\..*\.(tk|ml|ga|cf|gq)$".to_string(),
            severity: Severity::High,
            enabled: true,
        },
        RuleDefinition {
            id: "dga_domain".to_string(),
            name: "DGA domain".to_string(),
            description: "Possible algorithmically generated domain".to_string(),
            pattern: r"[a-z]{8,20}\.(com|net|org|info|biz)$".to_string(),
            severity: Severity::Medium,
            enabled: true,
        },
    ]
}
