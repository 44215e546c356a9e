use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::FeedMessage;

/// Decodes the line-oriented real-time feed
pub struct FeedReader<R> {
    lines: Lines<R>,
}

impl FeedReader<BufReader<TcpStream>> {
    /// Connect to a running real-time server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(BufReader::new(stream)))
    }
}

impl<R: AsyncBufRead + Unpin> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        FeedReader {
            lines: reader.lines(),
        }
    }

    /// Next decodable message, or `None` once the server closes the stream.
    /// Lines that fail to decode are skipped.
    pub async fn next_message(&mut self) -> std::io::Result<Option<FeedMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => log::debug!("Ignoring undecodable feed line: {}", e),
            }
        }
        Ok(None)
    }
}
