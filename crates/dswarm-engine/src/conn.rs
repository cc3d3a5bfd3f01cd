//! Per-connection plumbing: one reader task per worker socket, feeding a
//! single internal event channel that the wait loop drains (spec §5:
//! "the only concurrency is with remote workers over the network").

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use crate::protocol::{self, LINE_MAX};
use crate::worker::WorkerHandle;

#[derive(Debug)]
pub enum ConnEvent {
    Line { handle: WorkerHandle, line: String, payload: Vec<u8> },
    Closed { handle: WorkerHandle },
    LineTooLong { handle: WorkerHandle },
}

/// Reads `\n`-delimited lines from one worker connection and forwards them
/// on `tx`, preserving per-worker FIFO order (spec §5). Exits (and sends
/// `Closed`) on EOF, a read error, or a line over `LINE_MAX`. A line that
/// promises a trailing byte payload (spec §4.6) must be completed within
/// `short_timeout_s` (spec §5 suspension point (b)); a worker that sends a
/// header and then stalls is disconnected rather than desyncing the stream.
pub async fn run_reader(handle: WorkerHandle, read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<ConnEvent>, short_timeout_s: u64) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let payload_timeout = Duration::from_secs(short_timeout_s);
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                let _ = tx.send(ConnEvent::Closed { handle });
                return;
            }
            Ok(_) => {
                if line.len() > LINE_MAX {
                    let _ = tx.send(ConnEvent::LineTooLong { handle });
                    return;
                }
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                let payload_len = protocol::trailing_payload_len(&trimmed);
                let mut payload = vec![0u8; payload_len];
                if payload_len > 0 {
                    match tokio::time::timeout(payload_timeout, reader.read_exact(&mut payload)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) | Err(_) => {
                            let _ = tx.send(ConnEvent::Closed { handle });
                            return;
                        }
                    }
                }
                if tx.send(ConnEvent::Line { handle, line: trimmed, payload }).is_err() {
                    return;
                }
            }
            Err(_) => {
                let _ = tx.send(ConnEvent::Closed { handle });
                return;
            }
        }
    }
}
