use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;

/// Out-of-band confirmation from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A block was committed containing these transactions
    Committed {
        tx_ids: Vec<String>,
        commit_time: DateTime<Utc>,
    },
    Rejected { tx_id: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to connect to event server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("event stream read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream closed")]
    Closed,
    #[error("event source already subscribed")]
    AlreadySubscribed,
}

impl EventError {
    /// A single undecodable event does not end the subscription.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EventError::Decode(_))
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<LedgerEvent, EventError>> + Send>>;

pub type SubscribeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<EventStream, EventError>> + Send + 'a>>;

/// Event subscription transport
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> SubscribeFuture<'_>;
}

/// Newline-delimited JSON events read from a TCP event server.
pub struct TcpEventSource {
    addr: String,
}

impl TcpEventSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl EventSource for TcpEventSource {
    fn subscribe(&self) -> SubscribeFuture<'_> {
        Box::pin(async move {
            let socket = TcpStream::connect(&self.addr)
                .await
                .map_err(|source| EventError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
            info!("Block listener subscribed to {}", self.addr);

            let lines = BufReader::new(socket).lines();
            let stream = futures::stream::unfold(Some(lines), |state| async move {
                let Some(mut lines) = state else {
                    return None;
                };
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let event = serde_json::from_str::<LedgerEvent>(line)
                                .map_err(EventError::from);
                            return Some((event, Some(lines)));
                        }
                        Ok(None) => return Some((Err(EventError::Closed), None)),
                        Err(e) => return Some((Err(EventError::Read(e)), None)),
                    }
                }
            });

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

/// In-process event source fed through an unbounded channel.
///
/// Can be subscribed once; the stream ends when every sender is dropped.
pub struct ChannelEventSource {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LedgerEvent>>>,
}

impl ChannelEventSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<LedgerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            receiver: Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

impl EventSource for ChannelEventSource {
    fn subscribe(&self) -> SubscribeFuture<'_> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        Box::pin(async move {
            let rx = receiver.ok_or(EventError::AlreadySubscribed)?;
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (Ok(event), rx))
            });
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_event_wire_format() {
        let committed: LedgerEvent = serde_json::from_str(
            r#"{"type":"committed","tx_ids":["a","b"],"commit_time":"2024-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        match committed {
            LedgerEvent::Committed { tx_ids, commit_time } => {
                assert_eq!(tx_ids, vec!["a", "b"]);
                assert_eq!(commit_time.to_rfc3339(), "2024-01-02T03:04:05+00:00");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let rejected: LedgerEvent = serde_json::from_str(
            r#"{"type":"rejected","tx_id":"T2","message":"insufficient funds"}"#,
        )
        .unwrap();
        assert_eq!(
            rejected,
            LedgerEvent::Rejected {
                tx_id: "T2".to_string(),
                message: "insufficient funds".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_channel_source_subscribes_once() {
        let (source, tx) = ChannelEventSource::new();
        let mut stream = source.subscribe().await.unwrap();
        assert!(matches!(
            source.subscribe().await,
            Err(EventError::AlreadySubscribed)
        ));

        tx.send(LedgerEvent::Rejected {
            tx_id: "T".to_string(),
            message: "no".to_string(),
        })
        .unwrap();
        drop(tx);

        assert!(matches!(
            stream.next().await,
            Some(Ok(LedgerEvent::Rejected { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tcp_source_reads_lines_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"{\"type\":\"rejected\",\"tx_id\":\"T9\",\"message\":\"dup\"}\n\nnot json\n",
                )
                .await
                .unwrap();
        });

        let source = TcpEventSource::new(addr.to_string());
        let mut stream = source.subscribe().await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Ok(LedgerEvent::Rejected { tx_id, .. })) if tx_id == "T9"
        ));
        match stream.next().await {
            Some(Err(e)) => assert!(!e.is_fatal()),
            other => panic!("expected decode error, got {:?}", other),
        }
        match stream.next().await {
            Some(Err(e)) => assert!(matches!(e, EventError::Closed)),
            other => panic!("expected closed, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tcp_source_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = TcpEventSource::new(addr.to_string());
        assert!(matches!(
            source.subscribe().await,
            Err(EventError::Connect { .. })
        ));
    }
}
