// Wire types for the job request message the worker receives over IPC.
// The listener forwards the control-plane body verbatim; this module is the
// single place that gives it shape.

use agent_common::constants::SYSTEM_CONNECTION_ENDPOINT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A job request dequeued from the control plane. Consumed exactly once by
/// one worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestMessage {
    #[serde(default)]
    pub request_id: u64,

    #[serde(default)]
    pub plan_id: Uuid,

    #[serde(default)]
    pub timeline_id: Uuid,

    #[serde(default)]
    pub job_id: Uuid,

    #[serde(default)]
    pub job_display_name: String,

    #[serde(default)]
    pub job_ref_name: String,

    #[serde(default)]
    pub steps: Vec<StepDescriptor>,

    #[serde(default)]
    pub variables: HashMap<String, VariableValueMessage>,

    #[serde(default)]
    pub resources: JobResources,

    #[serde(default)]
    pub mask_hints: Vec<MaskHint>,
}

impl JobRequestMessage {
    /// Validate the parts of the request the worker cannot run without.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.plan_id.is_nil() {
            anyhow::bail!("Job request is missing a plan id");
        }
        if self.timeline_id.is_nil() {
            anyhow::bail!("Job request is missing a timeline id");
        }
        if self.job_id.is_nil() {
            anyhow::bail!("Job request is missing a job id");
        }
        if self.steps.is_empty() {
            anyhow::bail!("Job request contains no steps");
        }
        if self.system_connection().is_none() {
            anyhow::bail!(
                "Job request is missing the '{}' endpoint",
                SYSTEM_CONNECTION_ENDPOINT
            );
        }
        Ok(())
    }

    /// The endpoint carrying the connection back to the control plane.
    pub fn system_connection(&self) -> Option<&ServiceEndpoint> {
        self.resources
            .endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(SYSTEM_CONNECTION_ENDPOINT))
    }
}

/// Variable value as carried in the job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValueMessage {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

/// The kind of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    Task,
    Script,
    Checkout,
    Plugin,
}

impl Default for StepKind {
    fn default() -> Self {
        StepKind::Task
    }
}

/// One step within a job. Immutable after job initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDescriptor {
    #[serde(default)]
    pub id: Uuid,

    /// Human-friendly display name.
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub ref_name: String,

    /// Condition expression (e.g. "succeeded()", "always()"). Empty means
    /// the default condition.
    #[serde(default)]
    pub condition: String,

    /// Timeout in minutes; zero means no step timeout.
    #[serde(default)]
    pub timeout_in_minutes: u32,

    #[serde(default)]
    pub continue_on_error: bool,

    /// Container alias to run in; `None` targets the host.
    #[serde(default)]
    pub target: Option<String>,

    pub kind: StepKind,

    /// Task / plugin reference for handler resolution.
    #[serde(default)]
    pub reference: Option<TaskReference>,

    /// Inline script body for script steps.
    #[serde(default)]
    pub script: Option<String>,

    /// Kind-specific payload.
    #[serde(default)]
    pub inputs: HashMap<String, String>,

    /// Step-level environment variable overrides.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A versioned task bundle reference with its handler contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReference {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// The handler executable, absolute or relative to the tools directory.
    #[serde(default)]
    pub handler: String,
}

/// Resources attached to a job request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResources {
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub repositories: Vec<RepositoryResource>,
    #[serde(default)]
    pub secure_files: Vec<SecureFileResource>,
    #[serde(default)]
    pub containers: Vec<ContainerResource>,
}

/// A service endpoint, including the system connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub authorization: Option<EndpointAuthorization>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl ServiceEndpoint {
    /// The access token parameter, if present.
    pub fn access_token(&self) -> Option<&String> {
        self.authorization
            .as_ref()
            .and_then(|a| a.parameters.get("AccessToken"))
    }
}

/// Authorization data for a service endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthorization {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// A repository resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryResource {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A secure-file download ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureFileResource {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ticket: String,
}

/// A container resource (job container, sidecar, or step target).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResource {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub credentials: Option<ContainerCredentials>,
}

/// Registry credentials for a container resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The kind of a mask hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskHintType {
    Literal,
    Regex,
}

/// A secret-masking hint carried on the job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskHint {
    #[serde(rename = "type")]
    pub hint_type: MaskHintType,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> JobRequestMessage {
        JobRequestMessage {
            request_id: 7,
            plan_id: Uuid::new_v4(),
            timeline_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_display_name: "Build".into(),
            job_ref_name: "__build".into(),
            steps: vec![StepDescriptor {
                id: Uuid::new_v4(),
                display_name: "Run script".into(),
                ref_name: "__run".into(),
                condition: String::new(),
                timeout_in_minutes: 0,
                continue_on_error: false,
                target: None,
                kind: StepKind::Script,
                reference: None,
                script: Some("echo hi".into()),
                inputs: HashMap::new(),
                environment: HashMap::new(),
            }],
            variables: HashMap::new(),
            resources: JobResources {
                endpoints: vec![ServiceEndpoint {
                    name: "SystemVssConnection".into(),
                    url: "https://pipelines.example.com".into(),
                    authorization: None,
                    data: HashMap::new(),
                }],
                ..Default::default()
            },
            mask_hints: Vec::new(),
        }
    }

    #[test]
    fn valid_request_passes_validation() {
        minimal_request().validate().unwrap();
    }

    #[test]
    fn missing_steps_fails_validation() {
        let mut request = minimal_request();
        request.steps.clear();
        assert!(request.validate().is_err());
    }

    #[test]
    fn missing_system_connection_fails_validation() {
        let mut request = minimal_request();
        request.resources.endpoints.clear();
        assert!(request.validate().is_err());
    }

    #[test]
    fn deserializes_camel_case_json() {
        let json = r#"{
            "requestId": 12,
            "planId": "6f9c8f10-98f4-4f62-9e1a-30e6a9992c3b",
            "timelineId": "a26c4a2c-0afa-42ed-a0bd-f0ac4ba2a45e",
            "jobId": "f3f3f24c-30c4-4e2f-82c9-4bd573b41098",
            "jobDisplayName": "Build",
            "steps": [
                {"kind": "script", "displayName": "Say hi", "script": "echo hi"}
            ],
            "variables": {
                "token": {"value": "abc", "isSecret": true}
            },
            "maskHints": [{"type": "Regex", "value": "key-[0-9]+"}]
        }"#;
        let request: JobRequestMessage = serde_json::from_str(json).unwrap();
        assert_eq!(request.request_id, 12);
        assert_eq!(request.steps.len(), 1);
        assert_eq!(request.steps[0].kind, StepKind::Script);
        assert!(request.variables.get("token").unwrap().is_secret);
        assert_eq!(request.mask_hints[0].hint_type, MaskHintType::Regex);
    }
}
