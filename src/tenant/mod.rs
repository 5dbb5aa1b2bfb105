//! Tenant resolution and per-tenant path scoping.
//!
//! Every inbound credential maps to exactly one tenant; every path and blob
//! key the rest of the system touches is derived through a [`TenantScope`]
//! so cross-tenant access cannot be assembled by string concatenation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::AuthConfig;
use crate::error::{ApiaryError, Result};
use crate::ident::{self, IdentKind};

/// Reserved tenant used when authentication is disabled.
pub const DEFAULT_TENANT: &str = "default";

pub struct TenantResolver {
    enabled: bool,
    credentials: HashMap<String, String>,
}

impl TenantResolver {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        for tenant in config.credentials.values() {
            ident::validate(tenant, IdentKind::Tenant)?;
        }
        Ok(Self {
            enabled: config.enabled,
            credentials: config.credentials.clone(),
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            credentials: HashMap::new(),
        }
    }

    /// Map a request credential to a tenant id.
    ///
    /// With auth disabled every request lands in [`DEFAULT_TENANT`]. With
    /// auth enabled a missing or unknown credential is rejected.
    pub fn resolve(&self, credential: Option<&str>) -> Result<String> {
        if !self.enabled {
            return Ok(DEFAULT_TENANT.to_string());
        }
        let key = credential.ok_or(ApiaryError::UnknownCredential)?;
        self.credentials
            .get(key)
            .cloned()
            .ok_or(ApiaryError::UnknownCredential)
    }
}

/// Validated tenant identity plus the directory layout derived from it.
///
/// ```text
/// <data_dir>/workspaces/<tenant>/<job_id>/   ephemeral job workspace
/// <data_dir>/memory/<tenant>/state.db        knowledge / trail / run store
/// artifacts/<tenant>/jobs/<job_id>/...       blob key prefix
/// ```
#[derive(Debug, Clone)]
pub struct TenantScope {
    tenant_id: String,
    data_dir: PathBuf,
}

impl TenantScope {
    pub fn new(data_dir: impl Into<PathBuf>, tenant_id: &str) -> Result<Self> {
        let tenant_id = ident::validate(tenant_id, IdentKind::Tenant)?;
        Ok(Self {
            tenant_id,
            data_dir: data_dir.into(),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.data_dir.join("workspaces").join(&self.tenant_id)
    }

    pub fn workspace_dir(&self, job_id: &str) -> Result<PathBuf> {
        ident::ensure_validated(job_id, IdentKind::Run)?;
        Ok(self.workspace_root().join(job_id))
    }

    /// Blob-store key prefix for a job's artifacts.
    pub fn artifact_prefix(&self, job_id: &str) -> Result<String> {
        ident::ensure_validated(job_id, IdentKind::Run)?;
        Ok(format!("{}/jobs/{}", self.tenant_id, job_id))
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory").join(&self.tenant_id)
    }

    pub fn state_db(&self) -> PathBuf {
        self.memory_dir().join("state.db")
    }

    /// Coordination directory for a swarm run (blackboard, lock, signals).
    pub fn coordination_dir(&self, run_id: &str) -> Result<PathBuf> {
        ident::ensure_validated(run_id, IdentKind::Run)?;
        Ok(self.workspace_root().join(run_id).join(".coordination"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn auth_with(pairs: &[(&str, &str)]) -> AuthConfig {
        AuthConfig {
            enabled: true,
            credentials: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_disabled_auth_resolves_default() {
        let resolver = TenantResolver::disabled();
        assert_eq!(resolver.resolve(None).unwrap(), DEFAULT_TENANT);
        assert_eq!(resolver.resolve(Some("anything")).unwrap(), DEFAULT_TENANT);
    }

    #[test]
    fn test_enabled_auth_requires_known_credential() {
        let resolver = TenantResolver::new(&auth_with(&[("key-1", "acme")])).unwrap();
        assert_eq!(resolver.resolve(Some("key-1")).unwrap(), "acme");
        assert!(matches!(
            resolver.resolve(Some("nope")),
            Err(ApiaryError::UnknownCredential)
        ));
        assert!(matches!(
            resolver.resolve(None),
            Err(ApiaryError::UnknownCredential)
        ));
    }

    #[test]
    fn test_invalid_tenant_in_config_rejected() {
        assert!(TenantResolver::new(&auth_with(&[("k", "bad tenant")])).is_err());
    }

    #[test]
    fn test_scope_paths() {
        let scope = TenantScope::new("/tmp/apiary", "acme").unwrap();
        let ws = scope.workspace_dir("job-1").unwrap();
        assert!(ws.ends_with("workspaces/acme/job-1"));
        assert_eq!(scope.artifact_prefix("job-1").unwrap(), "acme/jobs/job-1");
        assert!(scope.state_db().ends_with("memory/acme/state.db"));
    }

    #[test]
    fn test_scope_rejects_path_traversal() {
        let scope = TenantScope::new("/tmp/apiary", "acme").unwrap();
        assert!(scope.workspace_dir("../other").is_err());
        assert!(scope.artifact_prefix("a/b").is_err());
    }
}
