use crate::models::{AnalysisResult, REQUEST_TIME_FORMAT};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Number of top domains listed in a report
pub const REPORT_TOP_DOMAINS: usize = 10;

/// Render the analysis report into any writer.
///
/// Sections appear in a fixed order: summary, malicious records, suspicious
/// actors, top domains. Empty sections are left out.
pub fn write_report<W: Write>(result: &AnalysisResult, out: &mut W) -> std::io::Result<()> {
    writeln!(out, "URL Access Analysis Report")?;
    writeln!(out, "==========================")?;
    writeln!(out, "Analyzed at: {}", result.analyzed_at.format(REQUEST_TIME_FORMAT))?;
    writeln!(out, "Total records: {}", result.total_records)?;
    writeln!(out, "Malicious records: {}", result.classifications.len())?;
    writeln!(out, "Suspicious actors: {}", result.suspicious_actors.len())?;
    writeln!(out, "Unique domains: {}", result.domain_stats.len())?;
    writeln!(out)?;

    if !result.classifications.is_empty() {
        writeln!(out, "Malicious Records:")?;
        writeln!(out, "------------------")?;
        for c in &result.classifications {
            writeln!(
                out,
                "Time: {} | Actor: {} | Domain: {} | Reason: {} | Severity: {}",
                c.event.timestamp.format(REQUEST_TIME_FORMAT),
                c.event.actor_email,
                c.event.domain,
                c.reason,
                c.severity
            )?;
        }
        writeln!(out)?;
    }

    if !result.suspicious_actors.is_empty() {
        writeln!(out, "Suspicious Actors:")?;
        writeln!(out, "------------------")?;
        for actor in &result.suspicious_actors {
            writeln!(out, "- {}", actor)?;
        }
        writeln!(out)?;
    }

    if !result.top_domains.is_empty() {
        writeln!(out, "Top Domains:")?;
        writeln!(out, "------------")?;
        for (i, entry) in result.top_domains.iter().take(REPORT_TOP_DOMAINS).enumerate() {
            writeln!(out, "{}. {} (visits: {})", i + 1, entry.domain, entry.count)?;
        }
    }

    Ok(())
}

/// Render the analysis report as a string
pub fn generate_report(result: &AnalysisResult) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = write_report(result, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Write the analysis report to a file, replacing any previous content
pub fn save_report<P: AsRef<Path>>(result: &AnalysisResult, path: P) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_report(result, &mut writer)?;
    writer.flush()?;
    log::info!("Analysis report saved to {:?}", path);
    Ok(())
}
