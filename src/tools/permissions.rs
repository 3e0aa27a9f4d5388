//! Advisory tool permission checking.
//!
//! Corresponds to spec §4.3 ("Advisory permissions"). Each tool declares a
//! `{file_system, network, shell, env}` descriptor; a permission checker
//! compares it against a run-wide policy and matches file-system path
//! arguments against `allowed_paths`/`denied_paths` globs, refusing any
//! path that escapes the project root.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSystemAccess {
    None,
    Read,
    Write,
    Full,
}

impl Default for FileSystemAccess {
    fn default() -> Self {
        FileSystemAccess::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAccess {
    None,
    Local,
    External,
}

impl Default for NetworkAccess {
    fn default() -> Self {
        NetworkAccess::None
    }
}

/// A tool's advisory permission descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPermissions {
    pub file_system: FileSystemAccess,
    pub network: NetworkAccess,
    pub shell: bool,
    pub env: bool,
}

/// The run-wide policy a `PermissionChecker` enforces.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub file_system: FileSystemAccess,
    pub network: NetworkAccess,
    pub allow_shell: bool,
    pub allow_env: bool,
    pub project_root: PathBuf,
    pub allowed_paths: Vec<Pattern>,
    pub denied_paths: Vec<Pattern>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            file_system: FileSystemAccess::Full,
            network: NetworkAccess::External,
            allow_shell: true,
            allow_env: true,
            project_root: PathBuf::from("."),
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
        }
    }
}

pub struct PermissionChecker;

impl PermissionChecker {
    /// Check whether `permissions` is allowed under `policy`, and whether
    /// any path-shaped fields in `input` stay within the project root and
    /// satisfy the allow/deny glob lists. Returns the denial reason on
    /// refusal.
    pub fn check(policy: &PermissionPolicy, permissions: &ToolPermissions, input: &Value) -> Result<(), String> {
        if permissions.file_system > policy.file_system {
            return Err(format!(
                "file_system access {:?} exceeds policy {:?}",
                permissions.file_system, policy.file_system
            ));
        }
        if permissions.network > policy.network {
            return Err(format!(
                "network access {:?} exceeds policy {:?}",
                permissions.network, policy.network
            ));
        }
        if permissions.shell && !policy.allow_shell {
            return Err("shell access denied by policy".to_string());
        }
        if permissions.env && !policy.allow_env {
            return Err("environment access denied by policy".to_string());
        }

        if permissions.file_system != FileSystemAccess::None {
            for path_str in extract_paths(input) {
                Self::check_path(policy, &path_str)?;
            }
        }
        Ok(())
    }

    fn check_path(policy: &PermissionPolicy, path_str: &str) -> Result<(), String> {
        let candidate = policy.project_root.join(path_str);
        let normalized = normalize(&candidate);
        let root_normalized = normalize(&policy.project_root);

        if !normalized.starts_with(&root_normalized) {
            return Err(format!("path '{path_str}' escapes the project root"));
        }
        for deny in &policy.denied_paths {
            if deny.matches(path_str) || deny.matches(normalized.to_string_lossy().as_ref()) {
                return Err(format!("path '{path_str}' matches a denied pattern"));
            }
        }
        if !policy.allowed_paths.is_empty() {
            let allowed = policy
                .allowed_paths
                .iter()
                .any(|p| p.matches(path_str) || p.matches(normalized.to_string_lossy().as_ref()));
            if !allowed {
                return Err(format!("path '{path_str}' does not match any allowed pattern"));
            }
        }
        Ok(())
    }
}

/// Lexical normalization (no filesystem access — the path need not exist).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                out.pop();
            }
            CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Best-effort extraction of path-shaped string fields from a tool input:
/// a top-level `path` string, or a top-level `paths` array of strings.
fn extract_paths(input: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(obj) = input.as_object() {
        if let Some(Value::String(p)) = obj.get("path") {
            paths.push(p.clone());
        }
        if let Some(Value::Array(items)) = obj.get("paths") {
            for item in items {
                if let Value::String(p) = item {
                    paths.push(p.clone());
                }
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> PermissionPolicy {
        PermissionPolicy {
            file_system: FileSystemAccess::Write,
            network: NetworkAccess::None,
            allow_shell: false,
            allow_env: true,
            project_root: PathBuf::from("/project"),
            allowed_paths: Vec::new(),
            denied_paths: vec![Pattern::new("secrets/*").unwrap()],
        }
    }

    #[test]
    fn denies_tool_requiring_more_than_policy_grants() {
        let perms = ToolPermissions {
            file_system: FileSystemAccess::Full,
            ..Default::default()
        };
        let err = PermissionChecker::check(&policy(), &perms, &json!({})).unwrap_err();
        assert!(err.contains("file_system"));
    }

    #[test]
    fn denies_shell_when_policy_forbids() {
        let perms = ToolPermissions {
            shell: true,
            ..Default::default()
        };
        let err = PermissionChecker::check(&policy(), &perms, &json!({})).unwrap_err();
        assert!(err.contains("shell"));
    }

    #[test]
    fn denies_path_escaping_project_root() {
        let perms = ToolPermissions {
            file_system: FileSystemAccess::Read,
            ..Default::default()
        };
        let err = PermissionChecker::check(&policy(), &perms, &json!({"path": "../../etc/passwd"})).unwrap_err();
        assert!(err.contains("escapes"));
    }

    #[test]
    fn denies_path_matching_denied_glob() {
        let perms = ToolPermissions {
            file_system: FileSystemAccess::Read,
            ..Default::default()
        };
        let err = PermissionChecker::check(&policy(), &perms, &json!({"path": "secrets/key.pem"})).unwrap_err();
        assert!(err.contains("denied"));
    }

    #[test]
    fn allows_path_within_root_and_not_denied() {
        let perms = ToolPermissions {
            file_system: FileSystemAccess::Read,
            ..Default::default()
        };
        assert!(PermissionChecker::check(&policy(), &perms, &json!({"path": "src/main.rs"})).is_ok());
    }

    #[test]
    fn allow_list_restricts_to_matching_paths() {
        let mut p = policy();
        p.allowed_paths = vec![Pattern::new("src/*").unwrap()];
        let perms = ToolPermissions {
            file_system: FileSystemAccess::Read,
            ..Default::default()
        };
        assert!(PermissionChecker::check(&p, &perms, &json!({"path": "src/main.rs"})).is_ok());
        assert!(PermissionChecker::check(&p, &perms, &json!({"path": "docs/readme.md"})).is_err());
    }
}
