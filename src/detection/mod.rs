pub mod analyzer;
pub mod rules;

pub use analyzer::{
    write_sample_denylist, Analyzer, AnalyzerError, SUSPICIOUS_ACTOR_THRESHOLD, TOP_DOMAIN_LIMIT,
};
pub use rules::{builtin_rules, DomainMatcher, Rule, RuleDefinition, DENYLIST_RULE_ID};
