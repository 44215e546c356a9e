//! Offline analysis of persisted access logs
//!
//! Streams a log produced by the recorder, counts visits per actor and per
//! domain, classifies every event against the denylist and the ordered rule
//! list, then derives suspicious actors and the most visited domains.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use super::rules::{builtin_rules, DomainMatcher, Rule, RuleDefinition};
use crate::config::AnalyzerConfig;
use crate::models::{AccessEvent, AnalysisResult, Classification, DomainCount};

/// Classified events an actor needs before being flagged as suspicious
pub const SUSPICIOUS_ACTOR_THRESHOLD: usize = 5;

/// Number of domains kept in the ranking
pub const TOP_DOMAIN_LIMIT: usize = 20;

/// Errors that can occur while configuring the analyzer or reading input
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern for rule '{id}': {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule '{0}' is already registered")]
    DuplicateRule(String),
}

/// Denylist and rule based access log analyzer
pub struct Analyzer {
    /// Evaluation order; index 0 is always the denylist
    rules: Vec<Rule>,
}

impl Analyzer {
    /// Create an analyzer with the built-in rules and an empty denylist
    pub fn new() -> Self {
        let mut rules = vec![Rule::denylist()];
        for def in builtin_rules() {
            match def.compile() {
                Ok(rule) => rules.push(rule),
                Err(e) => log::error!("Failed to compile built-in rule {}: {}", def.id, e),
            }
        }
        Analyzer { rules }
    }

    /// Create an analyzer and apply the denylist and custom rules from config.
    ///
    /// A missing denylist file is logged and ignored; an invalid custom rule
    /// is returned as an error.
    pub fn with_config(config: &AnalyzerConfig) -> Result<Self, AnalyzerError> {
        let mut analyzer = Self::new();

        if let Some(ref path) = config.malicious_domains_path {
            if let Err(e) = analyzer.load_malicious_domains(path) {
                log::warn!("Failed to load malicious domain list: {}", e);
            }
        }

        for def in &config.custom_rules {
            analyzer.add_custom_rule(def.clone())?;
        }

        Ok(analyzer)
    }

    /// Load denylisted domains from a newline delimited file.
    ///
    /// Blank lines and lines starting with `#` are ignored. Returns the
    /// number of domains read.
    pub fn load_malicious_domains<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, AnalyzerError> {
        let path = path.as_ref();
        let io_err = |source| AnalyzerError::Io {
            path: path.to_path_buf(),
            source,
        };

        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let mut domains = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(io_err)?;
            let domain = line.trim();
            if domain.is_empty() || domain.starts_with('#') {
                continue;
            }
            domains.push(domain.to_string());
        }

        let count = domains.len();
        self.add_malicious_domains(domains);
        log::info!("Loaded {} malicious domains from {:?}", count, path);
        Ok(count)
    }

    /// Add domains to the denylist directly
    pub fn add_malicious_domains<I: IntoIterator<Item = String>>(&mut self, domains: I) {
        if let Some(DomainMatcher::Denylist(set)) = self.rules.first_mut().map(|r| &mut r.matcher) {
            set.extend(domains);
        }
    }

    pub fn malicious_domain_count(&self) -> usize {
        match self.rules.first().map(|r| &r.matcher) {
            Some(DomainMatcher::Denylist(set)) => set.len(),
            _ => 0,
        }
    }

    /// Compile and append a rule after the existing ones
    pub fn add_custom_rule(&mut self, def: RuleDefinition) -> Result<(), AnalyzerError> {
        if self.rules.iter().any(|r| r.id == def.id) {
            return Err(AnalyzerError::DuplicateRule(def.id));
        }

        let rule = def.compile().map_err(|source| AnalyzerError::InvalidPattern {
            id: def.id.clone(),
            source,
        })?;

        log::debug!("Registered rule {} ({})", rule.id, rule.severity);
        self.rules.push(rule);
        Ok(())
    }

    /// Enable or disable a rule by id. Returns false if no such rule exists.
    pub fn set_rule_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify one event; the first matching rule wins
    pub fn classify(&self, event: &AccessEvent) -> Option<Classification> {
        let rule = self.rules.iter().find(|r| r.matches(&event.domain))?;
        Some(Classification {
            event: event.clone(),
            reason: rule.description.clone(),
            severity: rule.severity,
            rule_id: rule.id.clone(),
            detected_at: Utc::now(),
        })
    }

    /// Analyze a log file produced by the recorder
    pub fn analyze_log_file<P: AsRef<Path>>(&self, path: P) -> Result<AnalysisResult, AnalyzerError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| AnalyzerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        log::info!("Analyzing {:?}", path);
        self.analyze_reader(BufReader::new(file))
            .map_err(|source| AnalyzerError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Analyze JSON lines from any buffered reader.
    ///
    /// Unparseable lines are skipped, which also covers a trailing line the
    /// recorder is still writing.
    pub fn analyze_reader<R: BufRead>(&self, reader: R) -> std::io::Result<AnalysisResult> {
        let mut result = AnalysisResult::new();

        for (index, raw) in reader.split(b'\n').enumerate() {
            let raw = raw?;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event = match AccessEvent::from_json_line(line) {
                Ok(event) => event,
                Err(e) => {
                    log::debug!("Skipping line {}: {}", index + 1, e);
                    result.skipped_lines += 1;
                    continue;
                }
            };

            result.total_records += 1;
            *result.actor_stats.entry(event.actor_key()).or_insert(0) += 1;
            *result.domain_stats.entry(event.domain.clone()).or_insert(0) += 1;

            if let Some(classification) = self.classify(&event) {
                result.classifications.push(classification);
            }
        }

        result.suspicious_actors = find_suspicious_actors(&result.classifications);
        result.top_domains = top_domains(&result.domain_stats, TOP_DOMAIN_LIMIT);
        result.analyzed_at = Utc::now();

        log::info!(
            "Analysis complete: {} records, {} malicious, {} suspicious actors",
            result.total_records,
            result.classifications.len(),
            result.suspicious_actors.len()
        );

        Ok(result)
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Actors with at least `SUSPICIOUS_ACTOR_THRESHOLD` classified events, sorted
fn find_suspicious_actors(classifications: &[Classification]) -> Vec<String> {
    let mut per_actor: HashMap<String, usize> = HashMap::new();
    for c in classifications {
        *per_actor.entry(c.event.actor_key()).or_insert(0) += 1;
    }

    let mut actors: Vec<String> = per_actor
        .into_iter()
        .filter(|(_, count)| *count >= SUSPICIOUS_ACTOR_THRESHOLD)
        .map(|(actor, _)| actor)
        .collect();
    actors.sort();
    actors
}

/// Most visited domains, descending by count and then by name
fn top_domains(domain_stats: &HashMap<String, usize>, limit: usize) -> Vec<DomainCount> {
    let mut ranked: Vec<DomainCount> = domain_stats
        .iter()
        .map(|(domain, count)| DomainCount {
            domain: domain.clone(),
            count: *count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
    ranked.truncate(limit);
    ranked
}

/// Starter denylist written by `create-malicious-db`
const SAMPLE_DENYLIST: &str = "\
# Malicious domain list
# One domain per line, lines starting with # are comments

# Malware
malware.example.com
virus.test.com
trojan.bad.com
botnet.evil.com

# Phishing
phishing.fake.com
fake-bank.scam.com
login-secure.phish.com

# Suspicious
suspicious.tk
bad.ml
evil.ga

# Known bad (examples)
badsite.com
maliciousdomain.net
evilwebsite.org
";

/// Write a sample denylist to `path`, creating its directory if needed
pub fn write_sample_denylist<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, SAMPLE_DENYLIST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use std::io::{Cursor, Write};

    fn line(actor_id: i64, email: &str, domain: &str) -> String {
        serde_json::to_string(&AccessEvent::new(actor_id, email, domain, "vless")).unwrap()
    }

    fn log_of(lines: &[String]) -> Cursor<Vec<u8>> {
        Cursor::new(lines.join("\n").into_bytes())
    }

    #[test]
    fn test_denylist_match_is_high_severity() {
        let mut analyzer = Analyzer::new();
        analyzer.add_malicious_domains(vec!["evil.com".to_string()]);

        let result = analyzer
            .analyze_reader(log_of(&[line(1, "a@x.io", "evil.com"), line(1, "a@x.io", "good.io")]))
            .unwrap();

        assert_eq!(result.total_records, 2);
        assert_eq!(result.classifications.len(), 1);
        let c = &result.classifications[0];
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.rule_id, "malicious_domain_list");
        assert!(c.reason.contains("malicious domain list"));
    }

    #[test]
    fn test_denylist_overrides_rules() {
        let mut analyzer = Analyzer::new();
        // Would otherwise hit suspicious_tld (medium)
        analyzer.add_malicious_domains(vec!["bad.tk".to_string()]);

        let c = analyzer.classify(&AccessEvent::new(1, "a@x.io", "bad.tk", "tcp")).unwrap();
        assert_eq!(c.rule_id, "malicious_domain_list");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_malware_token_rule() {
        let analyzer = Analyzer::new();
        let result = analyzer
            .analyze_reader(log_of(&[line(2, "b@x.io", "trojan.foo.com")]))
            .unwrap();

        assert_eq!(result.classifications.len(), 1);
        assert_eq!(result.classifications[0].rule_id, "malware_domain");
        assert_eq!(result.classifications[0].severity, Severity::High);
    }

    #[test]
    fn test_registration_order_wins_over_severity() {
        let analyzer = Analyzer::new();
        // Matches suspicious_tld (medium, earlier) and suspicious_subdomain (high, later)
        let c = analyzer.classify(&AccessEvent::new(1, "a@x.io", "login.bank.tk", "tcp")).unwrap();
        assert_eq!(c.rule_id, "suspicious_tld");
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_suspicious_actor_threshold() {
        let analyzer = Analyzer::new();
        let mut lines = Vec::new();
        for _ in 0..5 {
            lines.push(line(1, "five@x.io", "virus.example.org"));
        }
        for _ in 0..4 {
            lines.push(line(2, "four@x.io", "virus.example.org"));
        }
        lines.push(line(2, "four@x.io", "example.org"));

        let result = analyzer.analyze_reader(log_of(&lines)).unwrap();
        assert_eq!(result.suspicious_actors, vec!["five@x.io(1)".to_string()]);
        assert_eq!(result.actor_stats["four@x.io(2)"], 5);
    }

    #[test]
    fn test_corrupt_and_blank_lines_are_skipped() {
        let analyzer = Analyzer::new();
        let data = format!(
            "{}\n\n{{not json\n{}\n{{\"user_id\":1,\"domain\":\"untimed.io\"}}\n{{\"user_id\":1,\"dom",
            line(1, "a@x.io", "one.io"),
            line(1, "a@x.io", "two.io")
        );

        let result = analyzer.analyze_reader(Cursor::new(data.into_bytes())).unwrap();
        assert_eq!(result.total_records, 2);
        assert_eq!(result.skipped_lines, 3);
        assert!(!result.domain_stats.contains_key("untimed.io"));
    }

    #[test]
    fn test_top_domains_ranking() {
        let analyzer = Analyzer::new();
        let mut lines = Vec::new();
        for i in 0..25 {
            for _ in 0..=i {
                lines.push(line(1, "a@x.io", &format!("site{}.io", i)));
            }
        }

        let result = analyzer.analyze_reader(log_of(&lines)).unwrap();
        assert_eq!(result.top_domains.len(), TOP_DOMAIN_LIMIT);
        assert_eq!(result.top_domains[0].domain, "site24.io");
        assert_eq!(result.top_domains[0].count, 25);
        assert!(result
            .top_domains
            .windows(2)
            .all(|w| w[0].count >= w[1].count));
    }

    #[test]
    fn test_custom_rules() {
        let mut analyzer = Analyzer::new();
        analyzer
            .add_custom_rule(RuleDefinition::new("casino", "Gambling", "casino", Severity::Low))
            .unwrap();

        let c = analyzer.classify(&AccessEvent::new(1, "a@x.io", "casino.io", "tcp")).unwrap();
        assert_eq!(c.rule_id, "casino");

        let err = analyzer
            .add_custom_rule(RuleDefinition::new("broken", "bad", "[", Severity::Low))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidPattern { .. }));
        assert!(analyzer.rules().iter().all(|r| r.id != "broken"));

        let err = analyzer
            .add_custom_rule(RuleDefinition::new("casino", "again", "x", Severity::Low))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::DuplicateRule(_)));
    }

    #[test]
    fn test_disable_rule() {
        let mut analyzer = Analyzer::new();
        assert!(analyzer.set_rule_enabled("malware_domain", false));
        assert!(!analyzer.set_rule_enabled("missing", false));
        assert!(analyzer.classify(&AccessEvent::new(1, "a@x.io", "virus.io", "tcp")).is_none());
    }

    #[test]
    fn test_load_malicious_domains_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header\n\nevil.com\n  spaced.net  \n#skip.me").unwrap();

        let mut analyzer = Analyzer::new();
        assert_eq!(analyzer.load_malicious_domains(file.path()).unwrap(), 2);
        assert_eq!(analyzer.malicious_domain_count(), 2);
        assert!(analyzer.classify(&AccessEvent::new(1, "a@x.io", "spaced.net", "tcp")).is_some());
    }

    #[test]
    fn test_missing_denylist_keeps_builtin_rules() {
        let mut analyzer = Analyzer::new();
        let before = analyzer.rules().len();
        assert!(analyzer.load_malicious_domains("/nonexistent/denylist.txt").is_err());
        assert_eq!(analyzer.rules().len(), before);
        assert!(analyzer.classify(&AccessEvent::new(1, "a@x.io", "trojan.x.com", "tcp")).is_some());
    }

    #[test]
    fn test_analyze_missing_file() {
        let analyzer = Analyzer::new();
        assert!(matches!(
            analyzer.analyze_log_file("/nonexistent/url_access.log"),
            Err(AnalyzerError::Io { .. })
        ));
    }

    #[test]
    fn test_sample_denylist_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/malicious_domains.txt");
        write_sample_denylist(&path).unwrap();

        let mut analyzer = Analyzer::new();
        assert_eq!(analyzer.load_malicious_domains(&path).unwrap(), 13);
        let hit = analyzer
            .classify(&AccessEvent::new(1, "a@x.io", "suspicious.tk", "tcp"))
            .unwrap();
        assert_eq!(hit.rule_id, crate::detection::DENYLIST_RULE_ID);
    }
}
