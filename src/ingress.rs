use std::io::{BufRead, BufReader, Read};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::protocol::PatternResponse;

/// Parses one line of input. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<PatternResponse>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Start the response reader in a blocking thread (std I/O is synchronous).
/// Each line is one miner response; undecodable lines are logged and
/// skipped so one bad response cannot stop the others.
pub fn start_reader<R: Read + Send + 'static>(
    source: R,
    tx: mpsc::Sender<PatternResponse>,
) -> std::thread::JoinHandle<usize> {
    std::thread::spawn(move || {
        let reader = BufReader::new(source);
        let mut forwarded = 0;
        for (n, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Ingress read error: {e}");
                    break;
                }
            };
            match parse_line(&line) {
                Ok(Some(response)) => {
                    // Blocks while the pipeline is saturated.
                    if tx.blocking_send(response).is_err() {
                        info!("Pipeline channel closed, stopping reader");
                        break;
                    }
                    forwarded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(line = n + 1, "Skipping undecodable response: {e}"),
            }
        }
        info!("Ingress reader finished after {forwarded} responses");
        forwarded
    })
}
