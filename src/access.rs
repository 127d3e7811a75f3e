//! Minimum-necessary access policy
//!
//! Maps each role to the resource categories it may read or modify.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::audit::event::{resources, roles};
use crate::config::loader::AccessPolicyFile;
use crate::error::Result;

const ALL_CATEGORIES: &str = "*";

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    grants: HashMap<String, HashSet<String>>,
}

impl AccessPolicy {
    pub fn from_grants<I, R, C>(grants: I) -> Self
    where
        I: IntoIterator<Item = (R, Vec<C>)>,
        R: Into<String>,
        C: Into<String>,
    {
        Self {
            grants: grants
                .into_iter()
                .map(|(role, categories)| {
                    (
                        role.into().to_ascii_uppercase(),
                        categories.into_iter().map(Into::into).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = AccessPolicyFile::load(path)?;
        Ok(Self::from_grants(file.roles))
    }

    /// Whether `actor_role` may touch `resource_category`. Unknown roles get nothing.
    pub fn check_access(&self, actor_role: &str, resource_category: &str) -> bool {
        match self.grants.get(&actor_role.to_ascii_uppercase()) {
            Some(categories) => {
                categories.contains(ALL_CATEGORIES) || categories.contains(resource_category)
            }
            None => false,
        }
    }

    pub fn categories_for(&self, actor_role: &str) -> Vec<String> {
        let mut categories: Vec<String> = self
            .grants
            .get(&actor_role.to_ascii_uppercase())
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        categories.sort();
        categories
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::from_grants([
            (roles::ADMIN, vec![ALL_CATEGORIES]),
            (roles::SYSTEM, vec![ALL_CATEGORIES]),
            (
                roles::DOCTOR,
                vec![resources::PATIENT_DATA, resources::MEDICAL_RECORDS, resources::APPOINTMENTS],
            ),
            (
                roles::NURSE,
                vec![resources::PATIENT_DATA, resources::MEDICAL_RECORDS, resources::APPOINTMENTS],
            ),
            (roles::RECEPTIONIST, vec![resources::PATIENT_DATA, resources::APPOINTMENTS]),
            (roles::BILLING, vec![resources::BILLING, resources::PATIENT_DATA]),
            (roles::PATIENT, vec![resources::APPOINTMENTS]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = AccessPolicy::default();
        assert!(policy.check_access("DOCTOR", "medical_records"));
        assert!(policy.check_access("doctor", "patient_data"));
        assert!(!policy.check_access("RECEPTIONIST", "medical_records"));
        assert!(!policy.check_access("BILLING", "medical_records"));
        assert!(policy.check_access("ADMIN", "audit"));
        assert!(!policy.check_access("UNKNOWN", "appointments"));
        assert!(!policy.check_access("JANITOR", "appointments"));
    }

    #[test]
    fn test_categories_for() {
        let policy = AccessPolicy::default();
        assert_eq!(policy.categories_for("PATIENT"), vec!["appointments"]);
        assert!(policy.categories_for("UNKNOWN").is_empty());
    }

    #[test]
    fn test_policy_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yml");
        std::fs::write(&path, "roles:\n  AUDITOR: [audit]\n").unwrap();

        let policy = AccessPolicy::from_file(&path).unwrap();
        assert!(policy.check_access("AUDITOR", "audit"));
        assert!(!policy.check_access("DOCTOR", "patient_data"));
    }
}
