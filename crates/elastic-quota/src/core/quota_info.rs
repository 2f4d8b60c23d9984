//! Per-group quota state.
//!
//! A [`QuotaInfo`] holds everything the engine tracks for one quota group:
//! the configured Min/Max/SharedWeight, the aggregated Request/Used and
//! non-preemptible buckets, the elastically computed Runtime, and the cache
//! of pods charged to the group. All mutable state sits behind the group's
//! own lock; the structural maps (parent/children) are owned by the manager
//! and the topology, which refer to groups by name only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use api_types::{ElasticQuota, ResourceList};
use k8s_openapi::api::core::v1::Pod;

use super::error::{QuotaError, Result};

/// Static description of a quota group, parsed from the persisted object.
/// This is what the topology validates and the manager stores.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaMeta {
    pub name: String,
    pub parent_name: String,
    pub tree_id: String,
    pub is_parent: bool,
    pub allow_lent_resource: bool,
    pub min: ResourceList,
    pub max: ResourceList,
    pub shared_weight: ResourceList,
}

impl QuotaMeta {
    /// Parse the governed fields out of a quota object. The shared weight
    /// defaults to Max when the annotation is absent.
    pub fn from_quota(quota: &ElasticQuota) -> Result<Self> {
        let name = api_types::quota_name(quota);
        if name.is_empty() {
            return Err(QuotaError::InvalidObject("quota has no name".to_string()));
        }
        let max = api_types::quota_max(quota)?;
        let min = api_types::quota_min(quota)?;
        let shared_weight = match api_types::quota_shared_weight(quota)? {
            Some(weight) if !weight.is_zero() => weight,
            _ => max.clone(),
        };
        Ok(Self {
            name: name.to_string(),
            parent_name: api_types::quota_parent_name(quota).to_string(),
            tree_id: api_types::quota_tree_id(quota).to_string(),
            is_parent: api_types::quota_is_parent(quota),
            allow_lent_resource: api_types::quota_allow_lent_resource(quota),
            min,
            max,
            shared_weight,
        })
    }
}

/// Cached state of one pod charged to a group.
#[derive(Debug, Clone)]
pub struct PodInfo {
    pub pod: Arc<Pod>,
    pub request: ResourceList,
    pub is_assigned: bool,
    pub is_non_preemptible: bool,
}

impl PodInfo {
    pub fn from_pod(pod: Arc<Pod>) -> Self {
        let request = api_types::pod_requests(&pod);
        let is_assigned = api_types::pod_is_assigned(&pod);
        let is_non_preemptible = api_types::pod_is_non_preemptible(&pod);
        Self {
            pod,
            request,
            is_assigned,
            is_non_preemptible,
        }
    }
}

/// Signed per-dimension change applied to a group and its ancestor chain.
#[derive(Debug, Clone, Default)]
pub struct QuotaDelta {
    pub request: ResourceList,
    pub used: ResourceList,
    pub non_preemptible_request: ResourceList,
    pub non_preemptible_used: ResourceList,
    pub allocated: ResourceList,
}

impl QuotaDelta {
    pub fn is_zero(&self) -> bool {
        self.request.is_zero()
            && self.used.is_zero()
            && self.non_preemptible_request.is_zero()
            && self.non_preemptible_used.is_zero()
            && self.allocated.is_zero()
    }

    pub fn negated(&self) -> Self {
        Self {
            request: ResourceList::new().sub(&self.request),
            used: ResourceList::new().sub(&self.used),
            non_preemptible_request: ResourceList::new().sub(&self.non_preemptible_request),
            non_preemptible_used: ResourceList::new().sub(&self.non_preemptible_used),
            allocated: ResourceList::new().sub(&self.allocated),
        }
    }

    /// Contribution of one cached pod, as a positive delta.
    pub fn for_pod(pod: &PodInfo) -> Self {
        let mut delta = QuotaDelta {
            request: pod.request.clone(),
            ..Default::default()
        };
        if pod.is_non_preemptible {
            delta.non_preemptible_request = pod.request.clone();
        }
        if pod.is_assigned {
            delta.used = pod.request.clone();
            delta.allocated = pod.request.clone();
            if pod.is_non_preemptible {
                delta.non_preemptible_used = pod.request.clone();
            }
        }
        delta
    }
}

#[derive(Debug, Default)]
pub(crate) struct QuotaInfoState {
    pub parent_name: String,
    pub tree_id: String,
    pub is_parent: bool,
    pub allow_lent_resource: bool,
    pub min: ResourceList,
    pub max: ResourceList,
    pub shared_weight: ResourceList,
    pub request: ResourceList,
    pub used: ResourceList,
    pub non_preemptible_request: ResourceList,
    pub non_preemptible_used: ResourceList,
    pub runtime: ResourceList,
    pub allocated: ResourceList,
    /// Tree version at which `runtime` was last computed.
    pub runtime_version: u64,
    pub pod_cache: HashMap<String, PodInfo>,
}

/// One quota group. Counters, runtime cache and pod cache are protected by
/// the group's own lock; acquisition order across groups is always ancestor
/// before descendant.
#[derive(Debug)]
pub struct QuotaInfo {
    name: String,
    state: RwLock<QuotaInfoState>,
}

impl QuotaInfo {
    pub fn new(meta: QuotaMeta) -> Self {
        let name = meta.name.clone();
        let state = QuotaInfoState {
            parent_name: meta.parent_name,
            tree_id: meta.tree_id,
            is_parent: meta.is_parent,
            allow_lent_resource: meta.allow_lent_resource,
            min: meta.min,
            max: meta.max,
            shared_weight: meta.shared_weight,
            ..Default::default()
        };
        Self {
            name,
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, QuotaInfoState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, QuotaInfoState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn parent_name(&self) -> String {
        self.read().parent_name.clone()
    }

    pub fn tree_id(&self) -> String {
        self.read().tree_id.clone()
    }

    pub fn is_parent(&self) -> bool {
        self.read().is_parent
    }

    pub fn allow_lent_resource(&self) -> bool {
        self.read().allow_lent_resource
    }

    pub fn get_min(&self) -> ResourceList {
        self.read().min.clone()
    }

    pub fn get_max(&self) -> ResourceList {
        self.read().max.clone()
    }

    pub fn get_shared_weight(&self) -> ResourceList {
        self.read().shared_weight.clone()
    }

    pub fn get_request(&self) -> ResourceList {
        self.read().request.clone()
    }

    pub fn get_used(&self) -> ResourceList {
        self.read().used.clone()
    }

    pub fn get_non_preemptible_request(&self) -> ResourceList {
        self.read().non_preemptible_request.clone()
    }

    pub fn get_non_preemptible_used(&self) -> ResourceList {
        self.read().non_preemptible_used.clone()
    }

    pub fn get_runtime(&self) -> ResourceList {
        self.read().runtime.clone()
    }

    pub fn get_allocated(&self) -> ResourceList {
        self.read().allocated.clone()
    }

    pub fn pod_cache_len(&self) -> usize {
        self.read().pod_cache.len()
    }

    pub fn has_pods(&self) -> bool {
        !self.read().pod_cache.is_empty()
    }

    /// Clone of the cached pods, keyed by uid.
    pub fn pods(&self) -> Vec<(String, PodInfo)> {
        self.read()
            .pod_cache
            .iter()
            .map(|(uid, info)| (uid.clone(), info.clone()))
            .collect()
    }

    pub fn get_pod(&self, uid: &str) -> Option<PodInfo> {
        self.read().pod_cache.get(uid).cloned()
    }

    pub fn check_pod_is_assigned(&self, uid: &str) -> bool {
        self.read()
            .pod_cache
            .get(uid)
            .map(|info| info.is_assigned)
            .unwrap_or(false)
    }

    /// Apply a signed delta to this group's aggregates.
    pub(crate) fn apply_delta(&self, delta: &QuotaDelta) {
        let mut state = self.write();
        state.request.add_assign(&delta.request);
        state.used.add_assign(&delta.used);
        state
            .non_preemptible_request
            .add_assign(&delta.non_preemptible_request);
        state
            .non_preemptible_used
            .add_assign(&delta.non_preemptible_used);
        state.allocated.add_assign(&delta.allocated);
    }

    /// Aggregate totals of this group as a positive delta, used when the
    /// whole subtree contribution moves between parents.
    pub(crate) fn aggregate_delta(&self) -> QuotaDelta {
        let state = self.read();
        QuotaDelta {
            request: state.request.clone(),
            used: state.used.clone(),
            non_preemptible_request: state.non_preemptible_request.clone(),
            non_preemptible_used: state.non_preemptible_used.clone(),
            allocated: state.allocated.clone(),
        }
    }

    /// Update the governed fields from a validated meta. Structural fields
    /// (parent, tree) are the manager's responsibility.
    pub(crate) fn update_meta(&self, meta: &QuotaMeta) {
        let mut state = self.write();
        state.parent_name = meta.parent_name.clone();
        state.is_parent = meta.is_parent;
        state.allow_lent_resource = meta.allow_lent_resource;
        state.min = meta.min.clone();
        state.max = meta.max.clone();
        state.shared_weight = meta.shared_weight.clone();
    }

    pub(crate) fn set_is_parent(&self, is_parent: bool) {
        self.write().is_parent = is_parent;
    }

    pub(crate) fn set_runtime(&self, runtime: ResourceList, version: u64) {
        let mut state = self.write();
        state.runtime = runtime;
        state.runtime_version = version;
    }

    pub(crate) fn runtime_if_current(&self, version: u64) -> Option<ResourceList> {
        let state = self.read();
        (state.runtime_version == version).then(|| state.runtime.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_types::{RESOURCE_CPU, RESOURCE_MEMORY};

    fn meta(name: &str) -> QuotaMeta {
        QuotaMeta {
            name: name.to_string(),
            parent_name: "root".to_string(),
            tree_id: String::new(),
            is_parent: false,
            allow_lent_resource: true,
            min: ResourceList::new().with(RESOURCE_CPU, 1_000),
            max: ResourceList::new().with(RESOURCE_CPU, 2_000),
            shared_weight: ResourceList::new().with(RESOURCE_CPU, 2_000),
        }
    }

    #[test]
    fn delta_roundtrip_restores_aggregates() {
        let info = QuotaInfo::new(meta("team-a"));
        let delta = QuotaDelta {
            request: ResourceList::new()
                .with(RESOURCE_CPU, 500)
                .with(RESOURCE_MEMORY, 100),
            used: ResourceList::new().with(RESOURCE_CPU, 500),
            ..Default::default()
        };
        info.apply_delta(&delta);
        assert_eq!(info.get_request().get(RESOURCE_CPU), 500);
        assert_eq!(info.get_used().get(RESOURCE_CPU), 500);

        info.apply_delta(&delta.negated());
        assert!(info.get_request().is_zero());
        assert!(info.get_used().is_zero());
    }

    #[test]
    fn pod_delta_classifies_buckets() {
        let mut pod = Pod::default();
        pod.metadata.uid = Some("uid-1".to_string());
        pod.metadata.labels = Some(
            [(api_types::LABEL_PREEMPTIBLE.to_string(), "false".to_string())]
                .into_iter()
                .collect(),
        );
        let mut info = PodInfo::from_pod(Arc::new(pod));
        info.request = ResourceList::new().with(RESOURCE_CPU, 100);
        info.is_assigned = true;

        let delta = QuotaDelta::for_pod(&info);
        assert_eq!(delta.request.get(RESOURCE_CPU), 100);
        assert_eq!(delta.used.get(RESOURCE_CPU), 100);
        assert_eq!(delta.non_preemptible_request.get(RESOURCE_CPU), 100);
        assert_eq!(delta.non_preemptible_used.get(RESOURCE_CPU), 100);

        info.is_assigned = false;
        let delta = QuotaDelta::for_pod(&info);
        assert!(delta.used.is_zero());
        assert_eq!(delta.non_preemptible_request.get(RESOURCE_CPU), 100);
        assert!(delta.non_preemptible_used.is_zero());
    }

    #[test]
    fn runtime_cache_tracks_version() {
        let info = QuotaInfo::new(meta("team-a"));
        assert!(info.runtime_if_current(3).is_none());
        info.set_runtime(ResourceList::new().with(RESOURCE_CPU, 700), 3);
        assert_eq!(
            info.runtime_if_current(3).unwrap().get(RESOURCE_CPU),
            700
        );
        assert!(info.runtime_if_current(4).is_none());
    }
}
