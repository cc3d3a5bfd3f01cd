use serde::{Deserialize, Serialize};

/// Identifies this manager instance in catalog updates and status responses.
///
/// Mirrors the shape of a small, disk-free config value the way
/// `SubmitterConfig` did in the teacher repo, but this one is never
/// persisted to disk: per the spec the manager keeps no state across
/// restarts, identity included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerIdentity {
    /// Project name (`DS_NAME` in the original environment-variable scheme).
    pub project: String,
    /// Best-effort owner string, usually derived from the OS user.
    pub owner: String,
    /// Crate version, reported verbatim in catalog/status payloads.
    pub version: String,
}

impl ManagerIdentity {
    /// Builds an identity from environment variables and crate metadata,
    /// falling back to reasonable defaults when nothing is set.
    pub fn from_env(project_override: Option<String>) -> Self {
        let project = project_override
            .or_else(|| std::env::var("DS_NAME").ok())
            .unwrap_or_else(|| "dswarm".to_string());
        let owner = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            project,
            owner,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_prefers_explicit_override() {
        let id = ManagerIdentity::from_env(Some("my-project".to_string()));
        assert_eq!(id.project, "my-project");
    }
}
