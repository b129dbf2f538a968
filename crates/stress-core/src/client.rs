use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use crate::events::{ChannelEventSource, LedgerEvent};
use crate::job::ChaincodeCommand;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// Remote refused the call; the message is kept verbatim
    #[error("{message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("response carried neither result nor error")]
    EmptyResponse,
}

pub type CallFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, SubmitError>> + Send + 'a>>;

/// Submit transport: one call per job, no retry.
///
/// Resolves to the transaction id for an accepted invoke, `None` for a query.
pub trait ChaincodeClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn call<'a>(&'a self, command: &'a ChaincodeCommand) -> CallFuture<'a>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: JsonRpcParams<'a>,
    id: u64,
}

#[derive(Debug, Serialize)]
struct JsonRpcParams<'a> {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(rename = "chaincodeID")]
    chaincode_id: ChaincodeId<'a>,
    #[serde(rename = "ctorMsg")]
    ctor_msg: CtorMsg<'a>,
}

#[derive(Debug, Serialize)]
struct ChaincodeId<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CtorMsg<'a> {
    args: &'a [String],
}

impl<'a> JsonRpcRequest<'a> {
    fn new(command: &'a ChaincodeCommand, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: if command.is_invoke { "invoke" } else { "query" },
            params: JsonRpcParams {
                kind: 1,
                chaincode_id: ChaincodeId {
                    name: &command.chaincode_id,
                },
                ctor_msg: CtorMsg {
                    args: &command.args,
                },
            },
            id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<JsonRpcResult>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResult {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl JsonRpcResponse {
    fn into_outcome(self, is_invoke: bool) -> Result<Option<String>, SubmitError> {
        if let Some(err) = self.error {
            return Err(SubmitError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = self.result.ok_or(SubmitError::EmptyResponse)?;
        if is_invoke {
            Ok(Some(result.message))
        } else {
            Ok(None)
        }
    }
}

/// JSON-RPC 2.0 chaincode client posting to the command's own URL
pub struct JsonRpcClient {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(timeout_ms: u64) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

impl ChaincodeClient for JsonRpcClient {
    fn name(&self) -> &'static str {
        "jsonrpc"
    }

    fn call<'a>(&'a self, command: &'a ChaincodeCommand) -> CallFuture<'a> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = JsonRpcRequest::new(command, id);

            let response = self.client.post(&command.url).json(&request).send().await?;
            let status = response.status();

            match response.json::<JsonRpcResponse>().await {
                Ok(body) => body.into_outcome(command.is_invoke),
                Err(_) if !status.is_success() => Err(SubmitError::Status(status.as_u16())),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// In-process stand-in for a chaincode endpoint.
///
/// Invokes get sequential `tx-<n>` ids. When paired with a [`MockLedger`] every
/// issued id is later committed on the ledger's event channel.
pub struct MockClient {
    delay: Duration,
    issued: AtomicU64,
    ledger: Option<MockLedger>,
}

impl MockClient {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            issued: AtomicU64::new(0),
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: MockLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }
}

impl ChaincodeClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn call<'a>(&'a self, command: &'a ChaincodeCommand) -> CallFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;
            if !command.is_invoke {
                return Ok(None);
            }

            let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
            let tx_id = format!("tx-{}", n);
            if let Some(ledger) = &self.ledger {
                ledger.commit_later(tx_id.clone());
            }
            Ok(Some(tx_id))
        })
    }
}

/// Commits every transaction handed to it after a fixed delay.
#[derive(Clone)]
pub struct MockLedger {
    events: mpsc::UnboundedSender<LedgerEvent>,
    commit_delay: Duration,
}

impl MockLedger {
    pub fn new(commit_delay_ms: u64) -> (Self, ChannelEventSource) {
        let (source, events) = ChannelEventSource::new();
        let ledger = Self {
            events,
            commit_delay: Duration::from_millis(commit_delay_ms),
        };
        (ledger, source)
    }

    fn commit_later(&self, tx_id: String) {
        let events = self.events.clone();
        let delay = self.commit_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let event = LedgerEvent::Committed {
                tx_ids: vec![tx_id],
                commit_time: chrono::Utc::now(),
            };
            if events.send(event).is_err() {
                debug!("mock ledger has no subscriber, dropping commit");
            }
        });
    }
}
