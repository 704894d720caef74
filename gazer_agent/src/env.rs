//! Environment configuration of the agent shell.
//!
//! All knobs are optional; a missing variable leaves the corresponding
//! behavior at its default (no token, default endpoints, unnamed
//! environment).

use std::env;

/// `GAZER_TOKEN`: API token presented to the control plane.
pub const ENV_TOKEN: &str = "GAZER_TOKEN";
/// `GAZER_AGENT_URL`: override for the agent control-plane endpoint.
pub const ENV_AGENT_URL: &str = "GAZER_AGENT_URL";
/// `GAZER_API_URL`: override for the API endpoint.
pub const ENV_API_URL: &str = "GAZER_API_URL";
/// `GAZER_ENVIRONMENT`: environment label attached to this process.
pub const ENV_ENVIRONMENT: &str = "GAZER_ENVIRONMENT";

/// Agent configuration assembled from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    /// API token, if configured.
    pub token: Option<String>,
    /// Agent endpoint override, if configured.
    pub agent_url: Option<String>,
    /// API endpoint override, if configured.
    pub api_url: Option<String>,
    /// Environment label, if configured.
    pub environment: Option<String>,
}

impl AgentConfig {
    /// Read the `GAZER_*` variables. Empty values count as unset.
    pub fn from_env() -> Self {
        fn get(name: &str) -> Option<String> {
            match env::var(name) {
                Ok(v) if !v.is_empty() => Some(v),
                _ => None,
            }
        }
        AgentConfig {
            token: get(ENV_TOKEN),
            agent_url: get(ENV_AGENT_URL),
            api_url: get(ENV_API_URL),
            environment: get(ENV_ENVIRONMENT),
        }
    }
}
