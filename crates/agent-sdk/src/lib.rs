// agent-sdk: Foundation layer for the Pipelines Agent.
// This crate has ZERO dependencies on other agent crates and provides
// core utilities, traits, and abstractions used throughout the agent.

pub mod arg_util;
pub mod build_constants;
pub mod io_util;
pub mod process_invoker;
pub mod string_util;
pub mod trace;
pub mod web_proxy;

// Re-export commonly used items at crate root
pub use arg_util::ArgUtil;
pub use build_constants::{AgentPackage, Source};
pub use io_util::IOUtil;
pub use process_invoker::{ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker};
pub use string_util::StringUtil;
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceWriter};
pub use web_proxy::AgentWebProxy;
