/// Build constants for the agent package. Stamped at build time via
/// compile-time environment variables, with fallbacks for local builds.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `AGENT_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("AGENT_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Agent package metadata.
#[derive(Debug, Clone)]
pub struct AgentPackage;

impl AgentPackage {
    /// The semantic version of the agent, from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// The package / distribution name.
    /// Set via the `AGENT_PACKAGE_NAME` env var at compile time, or "N/A".
    pub const PACKAGE_NAME: &'static str = match option_env!("AGENT_PACKAGE_NAME") {
        Some(n) => n,
        None => "N/A",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!AgentPackage::VERSION.is_empty());
    }

    #[test]
    fn commit_hash_has_default() {
        assert!(!Source::COMMIT_HASH.is_empty());
    }
}
