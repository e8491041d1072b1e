// version information stamped into every greeting

use serde::{Deserialize, Serialize};

/// Protocol version of this build.
///
/// A Sender puts `semantic` into its greeting and the remote Receiver refuses
/// the transfer when it does not match its own. Git information is carried only
/// for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,
    /// Git describe output (e.g., "v0.3.2-7-g644da27"), absent when built without git
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_describe: Option<String>,
    /// Full git commit hash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version of the running binary, git fields are filled in by build.rs.
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("SNAPREP_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("SNAPREP_GIT_HASH").map(String::from),
        }
    }

    /// Exact semantic match only.
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let ours = ProtocolVersion::current();
    /// assert!(ours.is_compatible_with_semantic(&ours.semantic));
    /// assert!(!ours.is_compatible_with_semantic("0.0.0-other"));
    /// ```
    pub fn is_compatible_with_semantic(&self, other: &str) -> bool {
        self.semantic == other
    }

    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => format!("{} ({})", self.semantic, git_describe),
            None => self.semantic.clone(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_matches_manifest() {
        let version = ProtocolVersion::current();
        assert_eq!(version.semantic, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn display_appends_git_describe() {
        let mut v = ProtocolVersion {
            semantic: "0.4.0".to_string(),
            git_describe: None,
            git_hash: None,
        };
        assert_eq!(v.display(), "0.4.0");
        v.git_describe = Some("v0.3.2-7-g644da27".to_string());
        assert_eq!(v.to_string(), "0.4.0 (v0.3.2-7-g644da27)");
    }

    #[test]
    fn json_omits_missing_git_fields() {
        let v = ProtocolVersion {
            semantic: "0.4.0".to_string(),
            git_describe: None,
            git_hash: None,
        };
        assert_eq!(v.to_json().unwrap(), r#"{"semantic":"0.4.0"}"#);
    }
}
