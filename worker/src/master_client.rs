// worker/src/master_client.rs
//
// HTTP calls from a task server to the job server.

use anyhow::{bail, Result};
use common::{
    AttemptRef, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};

/// What the job server made of a poll.
pub enum Poll {
    Work(TaskAssignmentResponse),
    /// The job server no longer knows this worker; register again.
    Forgotten,
}

#[derive(Clone)]
pub struct MasterClient {
    http: Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, req: &WorkerRegisterRequest) -> Result<WorkerId> {
        let url = format!("{}/api/v1/workers/register", self.base_url);
        let res = self.http.post(&url).json(req).send().await?.error_for_status()?;
        let WorkerRegisterResponse { worker_id } = res.json().await?;
        Ok(worker_id)
    }

    /// `Ok(false)` when the job server answered but did not accept the heartbeat.
    pub async fn heartbeat(&self, worker_id: &str, running_tasks: u32) -> Result<bool> {
        let url = format!("{}/api/v1/workers/heartbeat", self.base_url);
        let res = self
            .http
            .post(&url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.to_string(),
                running_tasks,
            })
            .send()
            .await?;
        Ok(res.status().is_success())
    }

    pub async fn poll(&self, worker_id: &str) -> Result<Poll> {
        let url = format!("{}/api/v1/tasks/next", self.base_url);
        let res = self
            .http
            .post(&url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(Poll::Forgotten),
            s if s.is_success() => Ok(Poll::Work(res.json().await?)),
            s => bail!("job server answered poll with {}", s),
        }
    }

    pub async fn complete(
        &self,
        worker_id: &str,
        attempt: &AttemptRef,
        success: bool,
        cause: Option<String>,
    ) -> Result<bool> {
        let url = format!("{}/api/v1/tasks/complete", self.base_url);
        let res = self
            .http
            .post(&url)
            .json(&TaskCompleteRequest {
                worker_id: worker_id.to_string(),
                attempt: attempt.clone(),
                success,
                cause,
            })
            .send()
            .await?
            .error_for_status()?;
        let TaskCompleteResponse { accepted } = res.json().await?;
        Ok(accepted)
    }
}
