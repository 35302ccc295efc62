//! Control-plane client.
//!
//! The client talks to the runtime exclusively through the shared
//! [`Provider`]: starts and signals are enqueued messages, queries read the
//! committed state. It never touches replay internals.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{InstanceMetadata, Provider, ProviderError, WorkItem};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::{AppErrorKind, ErrorDetails, Event};

/// Errors surfaced by client operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    InstanceNotFound(String),
    InstanceAlreadyExists(String),
    Codec(String),
    Provider(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InstanceNotFound(instance) => write!(f, "instance not found: {instance}"),
            ClientError::InstanceAlreadyExists(instance) => write!(f, "instance already exists: {instance}"),
            ClientError::Codec(msg) => write!(f, "codec error: {msg}"),
            ClientError::Provider(msg) => write!(f, "provider error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e.to_string())
    }
}

/// Instance snapshot with the original input, for diagnostic surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDetails {
    pub instance: String,
    pub orchestration_name: String,
    pub version: String,
    pub execution_id: u64,
    pub status: OrchestrationStatus,
    pub input: String,
    pub custom_status: Option<String>,
    pub parent_instance: Option<String>,
}

pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider instance.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start an orchestration instance with string input, bound to the
    /// registry's version policy at dispatch.
    ///
    /// The instance is visible as `Pending` as soon as this returns.
    /// Instance ids are single-use: re-starting anything past `Pending`
    /// fails with [`ClientError::InstanceAlreadyExists`].
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_orchestration_inner(instance, orchestration, None, input.into())
            .await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_orchestration_inner(instance, orchestration, Some(version.into()), input.into())
            .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(ClientError::Codec)?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Start a versioned orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_versioned_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(ClientError::Codec)?;
        self.start_orchestration_versioned(instance, orchestration, version, payload)
            .await
    }

    async fn start_orchestration_inner(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<String>,
        input: String,
    ) -> Result<(), ClientError> {
        if let Some(meta) = self.store.get_instance_metadata(instance).await? {
            // A pending instance may be re-enqueued (e.g. a retry after a
            // crash between registration and enqueue); anything further
            // along is a duplicate id.
            if meta.status != "Pending" {
                return Err(ClientError::InstanceAlreadyExists(instance.to_string()));
            }
        }

        self.store
            .register_instance(instance, orchestration, version.as_deref())
            .await?;

        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input,
            version,
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        };
        Ok(self.store.enqueue_for_orchestrator(item, None).await?)
    }

    /// Raise an external event into a running orchestration instance.
    ///
    /// Events without an open subscription buffer in history until the
    /// orchestration subscribes; per name, delivery is in raise order.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.ensure_instance_exists(instance).await?;
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.into(),
            data: data.into(),
        };
        Ok(self.store.enqueue_for_orchestrator(item, None).await?)
    }

    /// Raise an external event with typed data (serialized to JSON).
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: &T,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(data).map_err(ClientError::Codec)?;
        self.raise_event(instance, event_name, payload).await
    }

    /// Force the instance to `Terminated`. Overrides suspension, cancels
    /// in-flight sub-orchestrations, and never runs orchestration code.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.ensure_instance_exists(instance).await?;
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        Ok(self.store.enqueue_for_orchestrator(item, None).await?)
    }

    /// Pause message processing for the instance. Completions arriving while
    /// suspended buffer in history and replay after resume.
    pub async fn suspend_instance(&self, instance: &str) -> Result<(), ClientError> {
        self.ensure_instance_exists(instance).await?;
        let item = WorkItem::SuspendInstance {
            instance: instance.to_string(),
            reason: None,
        };
        Ok(self.store.enqueue_for_orchestrator(item, None).await?)
    }

    /// Resume a suspended instance.
    pub async fn resume_instance(&self, instance: &str) -> Result<(), ClientError> {
        self.ensure_instance_exists(instance).await?;
        let item = WorkItem::ResumeInstance {
            instance: instance.to_string(),
            reason: None,
        };
        Ok(self.store.enqueue_for_orchestrator(item, None).await?)
    }

    /// Status of the instance's latest execution.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let meta = match self.store.get_instance_metadata(instance).await? {
            Some(meta) => meta,
            None => return Ok(OrchestrationStatus::NotFound),
        };
        self.status_from_metadata(instance, meta).await
    }

    /// Instance snapshot including name, version, and the original input.
    pub async fn get_instance_details(&self, instance: &str) -> Result<InstanceDetails, ClientError> {
        let meta = match self.store.get_instance_metadata(instance).await? {
            Some(meta) => meta,
            None => return Err(ClientError::InstanceNotFound(instance.to_string())),
        };

        let history = self.store.read_with_execution(instance, meta.execution_id).await?;
        let input = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let details = InstanceDetails {
            instance: meta.instance.clone(),
            orchestration_name: meta.orchestration_name.clone(),
            version: meta.version.clone(),
            execution_id: meta.execution_id,
            input,
            custom_status: meta.custom_status.clone(),
            parent_instance: meta.parent_instance.clone(),
            status: self.status_from_metadata(instance, meta).await?,
        };
        Ok(details)
    }

    /// Poll until the instance reaches `Completed`, `Failed`, or
    /// `Terminated`, or the timeout expires. Continue-as-new is not
    /// terminal: waiting follows the instance across executions.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self
                .get_orchestration_status(instance)
                .await
                .map_err(|e| WaitError::Other(e.to_string()))?;
            match status {
                OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. } => return Ok(status),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait for completion and decode the output via the JSON codec.
    /// Failure and termination surface as [`WaitError::Other`].
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Out, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode(&output).map_err(WaitError::Other),
            OrchestrationStatus::Failed { details } => Err(WaitError::Other(details.display_message())),
            OrchestrationStatus::Terminated { reason } => Err(WaitError::Other(format!("terminated: {reason}"))),
            other => Err(WaitError::Other(format!("unexpected status: {other:?}"))),
        }
    }

    /// All known instance ids.
    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Execution ids recorded for an instance, ascending.
    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ClientError> {
        Ok(self.store.list_executions(instance).await?)
    }

    /// History of the instance's latest execution.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read(instance).await?)
    }

    /// History of one specific execution.
    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_with_execution(instance, execution_id).await?)
    }

    async fn ensure_instance_exists(&self, instance: &str) -> Result<(), ClientError> {
        match self.store.get_instance_metadata(instance).await? {
            Some(_) => Ok(()),
            None => Err(ClientError::InstanceNotFound(instance.to_string())),
        }
    }

    /// Structured failure details and continue-as-new inputs live in
    /// history, not the metadata row, so those statuses read it back.
    async fn status_from_metadata(
        &self,
        instance: &str,
        meta: InstanceMetadata,
    ) -> Result<OrchestrationStatus, ClientError> {
        let status = match meta.status.as_str() {
            "Pending" => OrchestrationStatus::Pending,
            "Running" => OrchestrationStatus::Running {
                custom_status: meta.custom_status,
            },
            "Suspended" => OrchestrationStatus::Suspended {
                custom_status: meta.custom_status,
            },
            "Completed" => OrchestrationStatus::Completed {
                output: meta.output.unwrap_or_default(),
            },
            "Terminated" => OrchestrationStatus::Terminated {
                reason: meta.output.unwrap_or_default(),
            },
            "Failed" => {
                let history = self.store.read_with_execution(instance, meta.execution_id).await?;
                let details = history
                    .iter()
                    .rev()
                    .find_map(|e| match e {
                        Event::OrchestrationFailed { details, .. } => Some(details.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| ErrorDetails::Application {
                        kind: AppErrorKind::OrchestrationFailed,
                        message: meta.output.unwrap_or_default(),
                        retryable: false,
                    });
                OrchestrationStatus::Failed { details }
            }
            "ContinuedAsNew" => {
                let history = self.store.read_with_execution(instance, meta.execution_id).await?;
                let input = history
                    .iter()
                    .rev()
                    .find_map(|e| match e {
                        Event::OrchestrationContinuedAsNew { input, .. } => Some(input.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                OrchestrationStatus::ContinuedAsNew { input }
            }
            other => {
                return Err(ClientError::Provider(format!(
                    "unknown status '{other}' for instance {instance}"
                )))
            }
        };
        Ok(status)
    }
}
