use std::path::PathBuf;
use structopt::StructOpt;

use urlscope::config::Config;
use urlscope::detection::{write_sample_denylist, Analyzer};
use urlscope::models::REQUEST_TIME_FORMAT;
use urlscope::output::{generate_report, save_report};
use urlscope::realtime::{FeedMessage, FeedReader};

/// URL access telemetry command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "urlscope", about = "URL access log analysis and monitoring")]
pub enum Cli {
    /// Analyze a URL access log for malicious site visits
    Analyze {
        /// Path to the URL access log
        #[structopt(short, long, default_value = "/var/log/urlscope/url_access.log")]
        log: PathBuf,
        /// Write the report to this file instead of the console
        #[structopt(short, long)]
        output: Option<PathBuf>,
        /// Malicious domain list, one domain per line
        #[structopt(short = "d", long)]
        malicious_db: Option<PathBuf>,
        /// Configuration file with analyzer settings
        #[structopt(short, long)]
        config: Option<PathBuf>,
        /// Only print the summary statistics
        #[structopt(long)]
        no_report: bool,
    },
    /// Create a sample malicious domain list
    CreateMaliciousDb {
        /// Output path for the list
        #[structopt(default_value = "/tmp/malicious_domains.txt")]
        path: PathBuf,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Print the real-time feed of a running daemon
    Monitor {
        /// Address of the real-time server
        #[structopt(short, long, default_value = "127.0.0.1:9999")]
        addr: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Analyze {
            log,
            output,
            malicious_db,
            config,
            no_report,
        } => {
            if !log.exists() {
                eprintln!("Log file not found: {:?}", log);
                std::process::exit(1);
            }

            let mut analyzer = match config {
                Some(path) => Analyzer::with_config(&Config::from_file(&path)?.analyzer)?,
                None => Analyzer::new(),
            };
            if let Some(path) = malicious_db {
                if let Err(e) = analyzer.load_malicious_domains(&path) {
                    log::warn!("Failed to load malicious domain list: {}", e);
                }
            }

            println!("Analyzing log file: {:?}", log);
            let result = analyzer.analyze_log_file(&log)?;

            if !no_report {
                match output {
                    Some(path) => {
                        save_report(&result, &path)?;
                        println!("Report saved to: {:?}", path);
                    }
                    None => println!("\n{}", generate_report(&result)),
                }
            }

            println!("\n=== Summary ===");
            println!("Total records: {}", result.total_records);
            println!("Malicious records: {}", result.malicious_count());
            println!("Suspicious actors: {}", result.suspicious_actors.len());
            println!("Unique domains: {}", result.domain_stats.len());
            if result.skipped_lines > 0 {
                println!("Skipped lines: {}", result.skipped_lines);
            }
            println!("Analyzed at: {}", result.analyzed_at.format(REQUEST_TIME_FORMAT));

            if result.malicious_count() > 0 {
                println!("\nFound {} malicious access records!", result.malicious_count());
            } else {
                println!("\nNo malicious access found");
            }
        }
        Cli::CreateMaliciousDb { path } => {
            write_sample_denylist(&path)?;
            println!("Sample malicious domain list written to: {:?}", path);
        }
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Monitor { addr } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(monitor(&addr))?;
        }
    }

    Ok(())
}

async fn monitor(addr: &str) -> std::io::Result<()> {
    let mut feed = FeedReader::connect(addr).await?;

    while let Some(message) = feed.next_message().await? {
        match message {
            FeedMessage::Welcome { message, time } => {
                println!("[{}] {}", time.format(REQUEST_TIME_FORMAT), message);
            }
            FeedMessage::Heartbeat { time } => {
                log::debug!("Heartbeat at {}", time);
            }
            FeedMessage::UrlAccess { data } => {
                println!(
                    "[{}] {} -> {}{}",
                    data.request_time,
                    data.actor_key(),
                    data.domain,
                    data.full_url.map(|u| format!(" ({})", u)).unwrap_or_default()
                );
            }
        }
    }

    println!("Feed closed by server");
    Ok(())
}
