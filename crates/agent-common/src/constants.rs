// Constants shared by the listener and worker processes: well-known
// directories and files, platform detection, exit codes, and the names of
// environment variables and job variables the core reads.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known directories used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Bin,
    Diag,
    Root,
    Temp,
    Tools,
    Update,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Well-known configuration files at the agent root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Agent,
    Credentials,
    Session,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "Darwin"),
            OsPlatform::Windows => write!(f, "Windows_NT"),
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "X86"),
            Architecture::X64 => write!(f, "X64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Arm64 => write!(f, "ARM64"),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

/// The current OS platform, detected at compile time.
#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

/// The current CPU architecture, detected at compile time.
#[cfg(target_arch = "x86")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X86;
#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;
#[cfg(target_arch = "arm")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm;
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm64;
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;

// ---------------------------------------------------------------------------
// Worker invocation contract
// ---------------------------------------------------------------------------

/// First positional argument the worker process expects.
pub const WORKER_SPAWN_CLIENT_TAG: &str = "spawnclient";

// ---------------------------------------------------------------------------
// ReturnCode
// ---------------------------------------------------------------------------

/// Process exit codes shared by the listener and the worker.
pub mod return_code {
    /// Clean exit.
    pub const SUCCESS: i32 = 0;
    /// Terminal failure; the service host must not restart the process.
    pub const TERMINATED_ERROR: i32 = 1;
    /// Retryable failure; the service host should restart the process.
    pub const RETRYABLE_ERROR: i32 = 2;
    /// Exit for agent self-update; the service host relaunches the new binary.
    pub const AGENT_UPDATING: i32 = 3;
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub mod path {
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const TEMP_DIRECTORY: &str = "_temp";
    pub const TOOL_DIRECTORY: &str = "_tool";
    pub const UPDATE_DIRECTORY: &str = "_update";
    pub const WORK_DIRECTORY: &str = "_work";
}

// ---------------------------------------------------------------------------
// Environment variables read by the core
// ---------------------------------------------------------------------------

pub mod env_vars {
    /// Skip self-update on refresh messages.
    pub const ACKNOWLEDGE_NO_UPDATES: &str = "AGENT_ACKNOWLEDGE_NO_UPDATES";
    /// Enable verbose HTTP tracing.
    pub const HTTP_TRACE: &str = "VSTS_AGENT_HTTPTRACE";
    /// Collect and upload diagnostic logs after each job.
    pub const DIAGNOSTIC: &str = "AGENT_DIAGNOSTIC";
}

// ---------------------------------------------------------------------------
// Well-known variable names
// ---------------------------------------------------------------------------

pub mod variables {
    pub mod agent {
        pub const ID: &str = "agent.id";
        pub const NAME: &str = "agent.name";
        pub const MACHINE_NAME: &str = "agent.machinename";
        pub const OS: &str = "agent.os";
        pub const OS_ARCHITECTURE: &str = "agent.osarchitecture";
        pub const SELF_HOSTED: &str = "agent.isselfhosted";
        pub const TOOLS_DIRECTORY: &str = "agent.toolsdirectory";
        pub const WORK_FOLDER: &str = "agent.workfolder";
        pub const TEMP_DIRECTORY: &str = "agent.tempdirectory";
        pub const VERSION: &str = "agent.version";
        pub const DIAGNOSTIC: &str = "agent.diagnostic";
        pub const DISABLE_UPDATE: &str = "agent.disableupdate";
        pub const PROXY_URL: &str = "agent.proxyurl";
        pub const PROXY_USERNAME: &str = "agent.proxyusername";
        pub const PROXY_PASSWORD: &str = "agent.proxypassword";
        pub const SSL_CA_INFO: &str = "agent.sslcainfo";
    }

    pub mod system {
        pub const DEBUG: &str = "system.debug";
        pub const CULTURE: &str = "system.culture";
        pub const SERVER_TYPE: &str = "system.servertype";
        pub const TF_COLLECTION_URI: &str = "system.teamfoundationcollectionuri";
    }
}

/// Name of the service endpoint carrying the control-plane connection.
pub const SYSTEM_CONNECTION_ENDPOINT: &str = "SystemVssConnection";
