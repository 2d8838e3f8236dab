// agent-common: Shared services and infrastructure for the Pipelines Agent.
// Both the listener and the worker process build on this crate.

pub mod config_store;
pub mod constants;
pub mod exceptions;
pub mod host_context;
pub mod paging_logger;
pub mod process_channel;
pub mod secret_masker;
pub mod task_result;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{AgentSettings, ConfigurationStore, CredentialData, SessionRecord};
pub use constants::{
    Architecture, OsPlatform, WellKnownConfigFile, WellKnownDirectory, CURRENT_ARCHITECTURE,
    CURRENT_PLATFORM,
};
pub use exceptions::NonRetryableError;
pub use host_context::{HostContext, ShutdownReason};
pub use paging_logger::PagingLogger;
pub use process_channel::{
    ChannelError, ChannelReceiver, ChannelSender, JobCancelBody, JobCompletedBody,
    JobMetadataBody, MessageType, ProcessChannel, ProcessChannelServer, WorkerMessage,
};
pub use secret_masker::SecretMasker;
pub use task_result::TaskResult;
pub use self::tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
