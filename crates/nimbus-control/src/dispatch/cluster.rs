//! Cluster backend: renders a one-shot job and submits it to the execution
//! substrate. The submission only confirms acceptance; the execution record
//! is resolved later by the runtime's completion callback or by the queue
//! timeout. Submission failures surface as distinct error codes and are
//! never retried here.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use nimbus_common::InvocationResult;

use crate::dispatch::job::{JobBuilder, JobManifest};
use crate::dispatch::DispatchOutcome;
use crate::task::InvocationTask;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("image pull authentication required: {0}")]
    PullAuthRequired(String),
    #[error("image registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("substrate API timeout after {0:?}")]
    Timeout(Duration),
    #[error("submission failed: {0}")]
    Other(String),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            SubmitError::PullAuthRequired(_) => "PULL_AUTH_REQUIRED",
            SubmitError::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
            SubmitError::Rejected(_) => "SUBMISSION_REJECTED",
            SubmitError::Timeout(_) => "CLUSTER_TIMEOUT",
            SubmitError::Other(_) => "DISPATCH_ERROR",
        }
    }
}

/// Seam to the execution substrate. The production implementation talks to
/// the cluster API over HTTP; tests drop in a recording stub.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, manifest: &JobManifest) -> Result<(), SubmitError>;
}

pub struct HttpJobSubmitter {
    http: reqwest::Client,
    jobs_url: String,
    api_timeout: Duration,
}

impl HttpJobSubmitter {
    pub fn new(http: reqwest::Client, jobs_url: impl Into<String>, api_timeout: Duration) -> Self {
        Self {
            http,
            jobs_url: jobs_url.into(),
            api_timeout,
        }
    }
}

#[async_trait]
impl JobSubmitter for HttpJobSubmitter {
    async fn submit(&self, manifest: &JobManifest) -> Result<(), SubmitError> {
        let response = self
            .http
            .post(&self.jobs_url)
            .timeout(self.api_timeout)
            .json(manifest)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SubmitError::Timeout(self.api_timeout)
                } else if err.is_connect() {
                    SubmitError::RegistryUnavailable(err.to_string())
                } else {
                    SubmitError::Other(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        Err(match status.as_u16() {
            404 => SubmitError::ImageNotFound(message),
            401 | 403 => SubmitError::PullAuthRequired(message),
            502 | 503 | 504 => SubmitError::RegistryUnavailable(message),
            _ => SubmitError::Rejected(message),
        })
    }
}

pub struct ClusterDispatcher {
    builder: JobBuilder,
    submitter: Box<dyn JobSubmitter>,
}

impl ClusterDispatcher {
    pub fn new(builder: JobBuilder, submitter: Box<dyn JobSubmitter>) -> Self {
        Self { builder, submitter }
    }

    pub async fn dispatch(&self, task: &InvocationTask) -> DispatchOutcome {
        let manifest = self.builder.build(task);
        match self.submitter.submit(&manifest).await {
            Ok(()) => {
                info!(
                    execution_id = %task.execution_id,
                    function = %task.function_name,
                    "job accepted by substrate"
                );
                DispatchOutcome::Pending
            }
            Err(err) => {
                error!(
                    execution_id = %task.execution_id,
                    function = %task.function_name,
                    error = %err,
                    "job submission failed"
                );
                DispatchOutcome::Completed(InvocationResult::error(err.code(), err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{FunctionSpec, InvocationRequest};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    struct StubSubmitter {
        outcome: Mutex<Option<SubmitError>>,
        submitted: Mutex<Vec<JobManifest>>,
    }

    impl StubSubmitter {
        fn accepting() -> Self {
            Self {
                outcome: Mutex::new(None),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: SubmitError) -> Self {
            Self {
                outcome: Mutex::new(Some(err)),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobSubmitter for StubSubmitter {
        async fn submit(&self, manifest: &JobManifest) -> Result<(), SubmitError> {
            self.submitted.lock().unwrap().push(manifest.clone());
            match self.outcome.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn task() -> InvocationTask {
        InvocationTask::new(
            "e-9",
            Arc::new(FunctionSpec::new("f", "img")),
            InvocationRequest::default(),
            None,
            None,
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn accepted_submission_stays_pending() {
        let submitter = Arc::new(StubSubmitter::accepting());
        let dispatcher = ClusterDispatcher::new(
            JobBuilder::new("http://cb"),
            Box::new(ArcSubmitter(submitter.clone())),
        );
        let outcome = dispatcher.dispatch(&task()).await;
        assert!(matches!(outcome, DispatchOutcome::Pending));
        assert_eq!(submitter.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submission_failure_completes_with_its_code() {
        let dispatcher = ClusterDispatcher::new(
            JobBuilder::new("http://cb"),
            Box::new(StubSubmitter::failing(SubmitError::ImageNotFound(
                "no such image".into(),
            ))),
        );
        let DispatchOutcome::Completed(result) = dispatcher.dispatch(&task()).await else {
            panic!("failed submission must complete the attempt");
        };
        assert_eq!(result.error_code(), Some("IMAGE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn unreachable_substrate_maps_to_unavailable() {
        let submitter = HttpJobSubmitter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/apis/batch/v1/jobs",
            Duration::from_millis(200),
        );
        let manifest = JobBuilder::new("http://cb").build(&task());
        let err = submitter.submit(&manifest).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::RegistryUnavailable(_) | SubmitError::Timeout(_) | SubmitError::Other(_)
        ));
    }

    // Adapter so a test can keep a handle on the stub after boxing it.
    struct ArcSubmitter(Arc<StubSubmitter>);

    #[async_trait]
    impl JobSubmitter for ArcSubmitter {
        async fn submit(&self, manifest: &JobManifest) -> Result<(), SubmitError> {
            self.0.submit(manifest).await
        }
    }
}
