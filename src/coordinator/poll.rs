use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PollConfig;
use crate::coordinator::discovery::AgentDescriptor;
use crate::health::HealthSample;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status fetch timed out")]
    Timeout,
}

/// Narrow seam over a peer's pull-based status surface. The surface itself
/// is an external collaborator; the coordinator only consumes it.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn fetch(&self, agent: &AgentDescriptor) -> Result<Vec<HealthSample>, ProbeError>;
}

/// HTTP implementation: `GET http://<agent>/api/health` returning a flat
/// `{metric: value}` JSON object.
pub struct HttpStatusProbe {
    client: reqwest::Client,
}

impl HttpStatusProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn fetch(&self, agent: &AgentDescriptor) -> Result<Vec<HealthSample>, ProbeError> {
        let url = format!("http://{}/api/health", agent.status_addr());
        let metrics: HashMap<String, f64> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let collected_at = Utc::now();
        Ok(metrics
            .into_iter()
            .map(|(metric, value)| HealthSample {
                agent_id: agent.agent_id.clone(),
                metric,
                value,
                collected_at,
            })
            .collect())
    }
}

/// Result of polling one agent.
#[derive(Debug)]
pub enum PollOutcome {
    Samples(Vec<HealthSample>),
    /// The poll failed; `unreachable` is set once the consecutive-failure
    /// budget is spent. Distinct from discovery expiry: an unreachable agent
    /// stays in the registry as long as it keeps announcing.
    Failed { consecutive: u32, unreachable: bool },
}

#[derive(Debug)]
pub struct PollReport {
    pub agent_id: String,
    pub outcome: PollOutcome,
}

/// Polls known agents with a per-call timeout. Agents are polled
/// independently; one unreachable peer never delays the others.
pub struct HealthPoller {
    probe: Arc<dyn StatusProbe>,
    timeout: Duration,
    max_failures: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl HealthPoller {
    pub fn new(probe: Arc<dyn StatusProbe>, config: &PollConfig) -> Self {
        Self {
            probe,
            timeout: config.timeout,
            max_failures: config.max_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn poll(&self, agent: &AgentDescriptor) -> PollReport {
        let result = match tokio::time::timeout(self.timeout, self.probe.fetch(agent)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        };

        match result {
            Ok(samples) => {
                self.failures.lock().await.remove(&agent.agent_id);
                PollReport {
                    agent_id: agent.agent_id.clone(),
                    outcome: PollOutcome::Samples(samples),
                }
            }
            Err(err) => {
                let consecutive = {
                    let mut failures = self.failures.lock().await;
                    let count = failures.entry(agent.agent_id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let unreachable = consecutive >= self.max_failures;
                if unreachable {
                    tracing::warn!(
                        agent = %agent.agent_id,
                        consecutive,
                        error = %err,
                        "Agent flagged unreachable"
                    );
                } else {
                    tracing::debug!(agent = %agent.agent_id, consecutive, error = %err, "Poll failed");
                }
                PollReport {
                    agent_id: agent.agent_id.clone(),
                    outcome: PollOutcome::Failed {
                        consecutive,
                        unreachable,
                    },
                }
            }
        }
    }

    /// Poll every agent concurrently.
    pub async fn poll_all(&self, agents: &[AgentDescriptor]) -> Vec<PollReport> {
        futures::future::join_all(agents.iter().map(|agent| self.poll(agent))).await
    }

    pub async fn consecutive_failures(&self, agent_id: &str) -> u32 {
        self.failures
            .lock()
            .await
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }
}
