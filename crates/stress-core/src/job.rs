use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::client::ChaincodeClient;

/// Remote call specification carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeCommand {
    /// Endpoint the call is posted to
    pub url: String,
    /// Chaincode (unit of work) identifier
    pub chaincode_id: String,
    pub args: Vec<String>,
    /// `true` for a state-mutating invoke, `false` for a read-only query
    pub is_invoke: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Stamped when execution starts
    pub submit_time: Option<DateTime<Utc>>,
    pub command: ChaincodeCommand,
}

impl Job {
    pub fn new(name: impl Into<String>, command: ChaincodeCommand) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            submit_time: None,
            command,
        }
    }

    /// Perform the remote call and derive the submission-side result record.
    ///
    /// An accepted invoke is not done yet: it stays `is_done = false` until the
    /// listener sees a commit or rejection for its transaction id.
    pub async fn execute(mut self, client: &dyn ChaincodeClient) -> JobStat {
        let submit_time = Utc::now();
        self.submit_time = Some(submit_time);

        let outcome = client.call(&self.command).await;
        let executed_time = Utc::now();

        let (tx_id, is_success, is_done, error_msg) = match (outcome, self.command.is_invoke) {
            (Ok(Some(tx_id)), true) if !tx_id.is_empty() => (tx_id, false, false, String::new()),
            (Ok(_), true) => (
                String::new(),
                false,
                true,
                "invoke accepted without a transaction id".to_string(),
            ),
            (Ok(_), false) => (String::new(), true, true, String::new()),
            (Err(e), _) => (String::new(), false, true, e.to_string()),
        };

        debug!(
            "{} executed: txid={:?} done={} error={:?}",
            self.name, tx_id, is_done, error_msg
        );

        JobStat {
            job_id: self.id,
            name: self.name,
            tx_id,
            submit_time,
            executed_time,
            confirmed_time: None,
            is_success,
            is_done,
            error_msg,
        }
    }
}

/// Status of one job from submission through confirmation.
///
/// Records are never edited in place once shared; the listener builds a
/// replacement with [`JobStat::committed`] or [`JobStat::rejected`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStat {
    pub job_id: String,
    pub name: String,
    /// Empty when the call produced no transaction
    pub tx_id: String,
    pub submit_time: DateTime<Utc>,
    pub executed_time: DateTime<Utc>,
    pub confirmed_time: Option<DateTime<Utc>>,
    pub is_success: bool,
    pub is_done: bool,
    pub error_msg: String,
}

impl JobStat {
    pub fn has_tx(&self) -> bool {
        !self.tx_id.is_empty()
    }

    pub fn committed(&self, commit_time: DateTime<Utc>) -> Self {
        Self {
            confirmed_time: Some(commit_time),
            is_success: true,
            is_done: true,
            error_msg: String::new(),
            ..self.clone()
        }
    }

    pub fn rejected(&self, at: DateTime<Utc>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "rejected without reason".to_string();
        }
        Self {
            confirmed_time: Some(at),
            is_success: false,
            is_done: true,
            error_msg: message,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SubmitError;
    use std::future::Future;
    use std::pin::Pin;

    struct FixedClient(fn() -> Result<Option<String>, SubmitError>);

    impl ChaincodeClient for FixedClient {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn call<'a>(
            &'a self,
            _command: &'a ChaincodeCommand,
        ) -> Pin<Box<dyn Future<Output = Result<Option<String>, SubmitError>> + Send + 'a>>
        {
            Box::pin(async move { (self.0)() })
        }
    }

    fn command(is_invoke: bool) -> ChaincodeCommand {
        ChaincodeCommand {
            url: "http://localhost:7050/chaincode".to_string(),
            chaincode_id: "mycc".to_string(),
            args: vec!["getUser".to_string()],
            is_invoke,
        }
    }

    #[tokio::test]
    async fn test_query_success_is_done() {
        let job = Job::new("query_1", command(false));
        let stat = job.execute(&FixedClient(|| Ok(None))).await;

        assert!(stat.is_success);
        assert!(stat.is_done);
        assert!(stat.tx_id.is_empty());
        assert!(stat.error_msg.is_empty());
        assert!(stat.executed_time >= stat.submit_time);
    }

    #[tokio::test]
    async fn test_query_failure_keeps_cause() {
        let job = Job::new("query_2", command(false));
        let stat = job
            .execute(&FixedClient(|| {
                Err(SubmitError::Rpc {
                    code: -32000,
                    message: "no such user".to_string(),
                })
            }))
            .await;

        assert!(!stat.is_success);
        assert!(stat.is_done);
        assert_eq!(stat.error_msg, "no such user");
    }

    #[tokio::test]
    async fn test_accepted_invoke_awaits_confirmation() {
        let job = Job::new("invoke_1", command(true));
        let id = job.id.clone();
        let stat = job
            .execute(&FixedClient(|| Ok(Some("T1".to_string()))))
            .await;

        assert_eq!(stat.job_id, id);
        assert_eq!(stat.tx_id, "T1");
        assert!(!stat.is_success);
        assert!(!stat.is_done);
        assert!(stat.confirmed_time.is_none());
    }

    #[tokio::test]
    async fn test_failed_invoke_has_no_tx() {
        let job = Job::new("invoke_2", command(true));
        let stat = job
            .execute(&FixedClient(|| Err(SubmitError::Status(503))))
            .await;

        assert!(stat.is_done);
        assert!(!stat.is_success);
        assert!(!stat.has_tx());
        assert_eq!(stat.error_msg, "unexpected http status 503");
    }

    #[test]
    fn test_rejected_always_carries_message() {
        let stat = JobStat {
            job_id: "j".to_string(),
            name: "n".to_string(),
            tx_id: "T".to_string(),
            submit_time: Utc::now(),
            executed_time: Utc::now(),
            confirmed_time: None,
            is_success: false,
            is_done: false,
            error_msg: String::new(),
        };

        let rejected = stat.rejected(Utc::now(), "");
        assert!(rejected.is_done);
        assert!(!rejected.error_msg.is_empty());

        let committed = stat.committed(stat.executed_time);
        assert!(committed.is_done && committed.is_success);
        assert_eq!(committed.confirmed_time, Some(stat.executed_time));
    }
}
