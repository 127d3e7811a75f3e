//! Access policy file loader
//! Loads the minimum-necessary access matrix from a YAML file

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::AuditError;

/// On-disk access policy: role name to the resource categories it may touch.
/// A category of `"*"` grants every category.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessPolicyFile {
    pub roles: HashMap<String, Vec<String>>,
}

impl AccessPolicyFile {
    pub fn load(path: &Path) -> Result<Self, AuditError> {
        info!("Loading access policy from: {:?}", path);

        let policy: Self = load_yaml(path)?;
        policy.validate()?;

        info!("Loaded access policy for {} roles", policy.roles.len());
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.roles.is_empty() {
            return Err(AuditError::ConfigError(
                "No roles defined in access policy".to_string(),
            ));
        }

        for (role, categories) in &self.roles {
            if role.trim().is_empty() {
                return Err(AuditError::ConfigError(
                    "Access policy contains an empty role name".to_string(),
                ));
            }
            if categories.iter().any(|c| c.trim().is_empty()) {
                return Err(AuditError::ConfigError(format!(
                    "Role {}: empty resource category",
                    role
                )));
            }
        }

        Ok(())
    }
}

/// Load a YAML file and deserialize it
fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, AuditError> {
    if !path.exists() {
        return Err(AuditError::ConfigError(format!(
            "Configuration file not found: {:?}",
            path
        )));
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        AuditError::ConfigError(format!("Failed to read {:?}: {}", path, e))
    })?;

    serde_yaml::from_str(&contents)
        .map_err(|e| AuditError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.yml");
        fs::write(
            &path,
            "roles:\n  ADMIN: [\"*\"]\n  NURSE:\n    - patient_data\n    - appointments\n",
        )
        .unwrap();

        let policy = AccessPolicyFile::load(&path).unwrap();
        assert_eq!(policy.roles.len(), 2);
        assert_eq!(policy.roles["NURSE"], vec!["patient_data", "appointments"]);
    }

    #[test]
    fn test_missing_file() {
        let result = AccessPolicyFile::load(Path::new("/nonexistent/access.yml"));
        assert!(matches!(result, Err(AuditError::ConfigError(_))));
    }

    #[test]
    fn test_empty_policy_rejected() {
        let policy = AccessPolicyFile {
            roles: HashMap::new(),
        };
        assert!(policy.validate().is_err());
    }
}
