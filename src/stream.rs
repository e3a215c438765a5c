//! Server-sent events stream over `ureq`.
//!
//! The blocking read loop runs on a `spawn_blocking` thread and forwards
//! the data of each event to an mpsc channel.
//!
//! ureq gives no way to interrupt a read that is already blocked, so a
//! closed stream stops forwarding at once but releases its connection and
//! thread when the next line arrives. Servers are expected to send
//! keepalive comments, which bounds that delay.

use anyhow::Result;
use async_trait::async_trait;
use livecore::net::{PushStreamFactory, StreamCloser};
use livecore::sse::SseDecoder;
use log::{debug, info, warn};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use ureq::Agent;

/// Stops forwarding at once and ends the read loop at the next line.
struct SseCloser {
    closed: Arc<AtomicBool>,
}

impl StreamCloser for SseCloser {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "Sse", "Push stream close requested");
        }
    }
}

pub struct SsePushStreamFactory {
    agent: Agent,
    capacity: usize,
}

impl SsePushStreamFactory {
    pub fn new(capacity: usize) -> Self {
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            capacity: capacity.max(1),
        }
    }
}

impl Default for SsePushStreamFactory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Eof,
    Closed,
    ReceiverGone,
    ReadError,
}

/// Forwards each complete event read from `reader` until the stream ends,
/// the closer fires or nobody is listening. An event cut off by the end of
/// the stream is not forwarded.
fn pump_events(
    mut reader: impl BufRead,
    closed: &AtomicBool,
    events: &mpsc::Sender<String>,
) -> StreamEnd {
    let mut decoder = SseDecoder::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                if decoder.has_pending() {
                    debug!(target: "Sse", "Discarding unterminated event at end of stream");
                }
                return StreamEnd::Eof;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "Sse", "Push stream read error: {e}");
                return StreamEnd::ReadError;
            }
        }
        if closed.load(Ordering::SeqCst) {
            return StreamEnd::Closed;
        }
        let trimmed = line.strip_suffix('\n').unwrap_or(&line);
        if let Some(data) = decoder.push_line(trimmed) {
            if closed.load(Ordering::SeqCst) {
                return StreamEnd::Closed;
            }
            if events.blocking_send(data).is_err() {
                return StreamEnd::ReceiverGone;
            }
        }
    }
}

#[async_trait]
impl PushStreamFactory for SsePushStreamFactory {
    async fn open_stream(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Arc<dyn StreamCloser>, mpsc::Receiver<String>)> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let auth = format!("Bearer {token}");
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let loop_closed = closed.clone();
        tokio::task::spawn_blocking(move || {
            let response = agent
                .get(&url)
                .header("Authorization", &auth)
                .header("Accept", "text/event-stream")
                .call();

            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let status = r.status().as_u16();
                    let _ = ready_tx.send(Err(anyhow::anyhow!(
                        "push stream rejected with status {status}"
                    )));
                    return;
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };

            info!(target: "Sse", "Push stream opened to {url}");
            if ready_tx.send(Ok(())).is_err() {
                return;
            }

            let reader = BufReader::new(response.into_body().into_reader());
            let end = pump_events(reader, &loop_closed, &event_tx);
            debug!(target: "Sse", "Push stream read loop finished: {end:?}");
        });

        ready_rx
            .await
            .map_err(|_| anyhow::anyhow!("push stream task exited before connecting"))??;

        Ok((Arc::new(SseCloser { closed }), event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(data) = rx.try_recv() {
            out.push(data);
        }
        out
    }

    #[test]
    fn forwards_complete_events_and_drops_the_unterminated_tail() {
        let (tx, mut rx) = mpsc::channel(8);
        let closed = AtomicBool::new(false);
        let body = Cursor::new("data: one\n\n: keepalive\ndata: two\n\ndata: cut");

        assert_eq!(pump_events(body, &closed, &tx), StreamEnd::Eof);
        assert_eq!(drain(&mut rx), vec!["one", "two"]);
    }

    /// Flips the close flag once the first event (13 bytes) has been read.
    struct CloseAfterFirstEvent<'a> {
        inner: Cursor<&'static str>,
        closed: &'a AtomicBool,
    }

    impl Read for CloseAfterFirstEvent<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.inner.position() >= 13 {
                self.closed.store(true, Ordering::SeqCst);
            }
            // One byte at a time so the flag is seen between lines.
            let end = buf.len().min(1);
            self.inner.read(&mut buf[..end])
        }
    }

    #[test]
    fn closing_stops_the_loop_at_the_next_line() {
        let (tx, mut rx) = mpsc::channel(8);
        let closed = AtomicBool::new(false);
        let reader = BufReader::with_capacity(
            1,
            CloseAfterFirstEvent {
                inner: Cursor::new("data: first\n\ndata: second\n\n"),
                closed: &closed,
            },
        );

        assert_eq!(pump_events(reader, &closed, &tx), StreamEnd::Closed);
        assert_eq!(drain(&mut rx), vec!["first"]);
    }

    #[test]
    fn loop_ends_when_nobody_listens() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let closed = AtomicBool::new(false);
        let body = Cursor::new("data: x\n\ndata: y\n\n");
        assert_eq!(pump_events(body, &closed, &tx), StreamEnd::ReceiverGone);
    }

    #[test]
    fn closing_twice_is_harmless() {
        let closed = Arc::new(AtomicBool::new(false));
        let closer = SseCloser {
            closed: closed.clone(),
        };
        closer.close();
        closer.close();
        assert!(closed.load(Ordering::SeqCst));
    }
}
