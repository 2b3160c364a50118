use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use igloo_common::DynamicFilterId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::domain::Domain;
use super::version::StatusVersion;

pub const INITIAL_DYNAMIC_FILTERS_VERSION: u64 = 0;

/// Domains collected so far, paired with the version they were read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDynamicFilterDomains {
    pub version: u64,
    pub domains: HashMap<DynamicFilterId, Domain>,
}

#[derive(Debug)]
struct CollectorState {
    version: u64,
    domains: HashMap<DynamicFilterId, Domain>,
}

/// Accumulates dynamic filter domains produced while the task runs.
pub struct DynamicFiltersCollector {
    state: Mutex<CollectorState>,
    status_version: Arc<StatusVersion>,
}

impl std::fmt::Debug for DynamicFiltersCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicFiltersCollector")
            .field("state", &self.state)
            .finish()
    }
}

impl DynamicFiltersCollector {
    /// Every non-empty update also bumps `status_version`, atomically with the merge.
    pub fn new(status_version: Arc<StatusVersion>) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                version: INITIAL_DYNAMIC_FILTERS_VERSION,
                domains: HashMap::new(),
            }),
            status_version,
        }
    }

    /// Intersects each incoming domain with the stored one.
    ///
    /// Every non-empty call bumps the version by one, even when nothing narrowed.
    pub fn update_domains(&self, new_domains: HashMap<DynamicFilterId, Domain>) {
        if new_domains.is_empty() {
            return;
        }
        let mut version = INITIAL_DYNAMIC_FILTERS_VERSION;
        self.status_version.update(|| {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for (filter_id, domain) in new_domains {
                let merged = match state.domains.get(&filter_id) {
                    Some(existing) => existing.intersect(&domain),
                    None => domain,
                };
                state.domains.insert(filter_id, merged);
            }
            state.version += 1;
            version = state.version;
            true
        });
        debug!(version, "Dynamic filter domains updated");
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Returns the full current mapping regardless of `_caller_version`.
    pub fn get_domains(&self, _caller_version: u64) -> VersionedDynamicFilterDomains {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        VersionedDynamicFilterDomains {
            version: state.version,
            domains: state.domains.clone(),
        }
    }
}
