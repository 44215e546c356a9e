pub mod ingest;

pub use ingest::{parse_datagram, IngestError, IngestListener};
