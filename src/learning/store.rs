//! Persistence of learned policies, one per institution.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::qtable::QTable;
use super::transfer::InstitutionProfile;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoredPolicy {
    pub profile: InstitutionProfile,
    pub table: QTable,
    /// Episodes accumulated over all runs.
    pub episodes: u64,
}

pub trait PolicyStore: Send + Sync {
    fn load(&self, institution: &str) -> Result<Option<StoredPolicy>>;

    /// Replaces the institution's policy as one transaction.
    fn save(&self, policy: &StoredPolicy) -> Result<()>;

    fn profiles(&self) -> Result<Vec<InstitutionProfile>>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: Mutex<HashMap<String, StoredPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredPolicy>> {
        self.policies.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn load(&self, institution: &str) -> Result<Option<StoredPolicy>> {
        Ok(self.lock().get(institution).cloned())
    }

    fn save(&self, policy: &StoredPolicy) -> Result<()> {
        self.lock().insert(policy.profile.institution.clone(), policy.clone());
        Ok(())
    }

    fn profiles(&self) -> Result<Vec<InstitutionProfile>> {
        let mut profiles: Vec<_> = self.lock().values().map(|p| p.profile.clone()).collect();
        profiles.sort_by(|a, b| a.institution.cmp(&b.institution));
        Ok(profiles)
    }
}

/// One JSON file per institution; writes go to a temp file renamed into place.
#[derive(Debug, Clone)]
pub struct JsonPolicyStore {
    dir: PathBuf,
}

impl JsonPolicyStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Policy store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, institution: &str) -> PathBuf {
        let name: String = institution
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl PolicyStore for JsonPolicyStore {
    fn load(&self, institution: &str) -> Result<Option<StoredPolicy>> {
        let path = self.path_for(institution);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let policy: StoredPolicy = serde_json::from_str(&raw)?;
        debug!("loaded policy for {institution} ({} entries)", policy.table.len());
        Ok(Some(policy))
    }

    fn save(&self, policy: &StoredPolicy) -> Result<()> {
        let path = self.path_for(&policy.profile.institution);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string(policy)?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        debug!("saved policy for {} to {}", policy.profile.institution, path.display());
        Ok(())
    }

    fn profiles(&self) -> Result<Vec<InstitutionProfile>> {
        let mut profiles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let policy: StoredPolicy = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Persistence(format!("{}: {e}", path.display())))?;
            profiles.push(policy.profile);
        }
        profiles.sort_by(|a, b| a.institution.cmp(&b.institution));
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CourseType;
    use crate::learning::qtable::{ActionKey, StateKey};

    fn policy(name: &str) -> StoredPolicy {
        let mut table = QTable::new();
        table.set(
            StateKey {
                course_type: CourseType::Seminar,
                day: 1,
                period: 2,
                load_bucket: 0,
            },
            ActionKey { day: 3, period: 1 },
            0.42,
        );
        StoredPolicy {
            profile: InstitutionProfile {
                institution: name.into(),
                features: [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            },
            table,
            episodes: 20,
        }
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPolicyStore::open(dir.path()).unwrap();
        assert!(store.load("uni/one").unwrap().is_none());
        store.save(&policy("uni/one")).unwrap();
        store.save(&policy("college")).unwrap();

        let reopened = JsonPolicyStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load("uni/one").unwrap(), Some(policy("uni/one")));
        let names: Vec<String> = reopened.profiles().unwrap().into_iter().map(|p| p.institution).collect();
        assert_eq!(names, vec!["college", "uni/one"]);
        // no temp files left behind
        assert!(fs::read_dir(dir.path()).unwrap().all(|e| {
            e.unwrap().path().extension().and_then(|x| x.to_str()) == Some("json")
        }));
    }

    #[test]
    fn test_in_memory_store_replaces() {
        let store = InMemoryPolicyStore::new();
        store.save(&policy("a")).unwrap();
        let mut updated = policy("a");
        updated.episodes = 40;
        store.save(&updated).unwrap();
        assert_eq!(store.load("a").unwrap().unwrap().episodes, 40);
        assert_eq!(store.profiles().unwrap().len(), 1);
    }
}
