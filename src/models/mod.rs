pub mod classification;
pub mod event;

pub use classification::{AnalysisResult, Classification, DomainCount, Severity};
pub use event::{AccessEvent, REQUEST_TIME_FORMAT};
