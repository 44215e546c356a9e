pub mod config;
pub mod detection;
pub mod input;
pub mod models;
pub mod output;
pub mod realtime;
pub mod recorder;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, RealtimeConfig, RecorderConfig};
pub use detection::{Analyzer, AnalyzerError, Rule, RuleDefinition};
pub use models::{AccessEvent, AnalysisResult, Classification, Severity};
pub use realtime::{Broadcaster, FeedMessage, FeedReader, RealtimeError};
pub use recorder::{Recorder, RecorderError};
pub use shutdown::Shutdown;
