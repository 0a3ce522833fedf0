//! Inbound event stream for the ingestion loop.
//!
//! This module defines the [`Event`] enum and the [`EventHandler`], which runs
//! a background task reading newline-delimited JSON [`LocationReceived`]
//! records and forwarding them over a channel. The loop in `main.rs` receives
//! events via [`EventHandler::next`].

use crate::models::LocationReceived;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Events processed by the ingestion loop.
#[derive(Debug)]
pub enum Event {
    /// A well-formed fix from the chat layer.
    Location(LocationReceived),
    /// A line that could not be decoded; the loop reports it and carries on.
    Malformed {
        /// 1-based input line number.
        line_no: usize,
        error: String,
    },
    /// Input closed. No further events follow.
    Eof,
}

/// Turns a line-oriented reader into a stream of [`Event`]s.
///
/// The reader task owns the sender; the handler holds the receiver. Blank
/// lines are skipped. A read error ends the stream the same way end of input
/// does, after logging it.
pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Reads events from the process's standard input.
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    /// Spawns the reader task over `reader`.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = reader.lines();
            let mut line_no = 0;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let event = match serde_json::from_str::<LocationReceived>(&line) {
                    Ok(location) => Event::Location(location),
                    Err(e) => {
                        warn!("Skipping malformed input line {}: {}", line_no, e);
                        Event::Malformed {
                            line_no,
                            error: e.to_string(),
                        }
                    }
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            tx.send(Event::Eof).ok();
        });

        Self { rx }
    }

    /// Receives the next event. Returns `None` once the reader task has gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
