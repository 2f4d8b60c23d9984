//! Owner of one quota tree.
//!
//! The manager holds the tree's QuotaInfos and adjacency, the cluster-total
//! pool fanned out at the root, and the accounting that keeps every
//! ancestor's aggregates consistent as pods and groups come and go. Runtime
//! vectors are recomputed lazily: every structural or request change bumps
//! the tree version, and a refresh walks the path from the root down,
//! redistributing each parent's capacity to its children.
//!
//! Lock order is manager lock before QuotaInfo locks, and ancestors before
//! descendants; delta propagation applies from the root downward.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use api_types::{ResourceList, ROOT_QUOTA_NAME};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error, warn};

use super::error::{QuotaError, Result};
use super::quota_info::{PodInfo, QuotaDelta, QuotaInfo, QuotaMeta};
use super::runtime_calculator::{calculate_child_runtimes, ChildQuota};

/// Cap on parent-chain walks. The topology refuses cycles, so hitting this
/// means the maps desynchronized.
const MAX_TREE_DEPTH: usize = 64;

struct ManagerInner {
    cluster_total: ResourceList,
    quota_infos: HashMap<String, Arc<QuotaInfo>>,
    children: HashMap<String, BTreeSet<String>>,
}

pub struct GroupQuotaManager {
    tree_id: String,
    enable_runtime_quota: bool,
    /// Monotonic version of the tree; bumped on any change that can affect
    /// runtime vectors. QuotaInfos caching an older version recompute.
    tree_version: AtomicU64,
    inner: RwLock<ManagerInner>,
}

impl GroupQuotaManager {
    pub fn new(tree_id: &str, enable_runtime_quota: bool) -> Self {
        let root = QuotaMeta {
            name: ROOT_QUOTA_NAME.to_string(),
            parent_name: String::new(),
            tree_id: tree_id.to_string(),
            is_parent: true,
            allow_lent_resource: true,
            min: ResourceList::new(),
            max: ResourceList::new(),
            shared_weight: ResourceList::new(),
        };
        let mut quota_infos = HashMap::new();
        quota_infos.insert(ROOT_QUOTA_NAME.to_string(), Arc::new(QuotaInfo::new(root)));
        let mut children = HashMap::new();
        children.insert(ROOT_QUOTA_NAME.to_string(), BTreeSet::new());
        Self {
            tree_id: tree_id.to_string(),
            enable_runtime_quota,
            tree_version: AtomicU64::new(1),
            inner: RwLock::new(ManagerInner {
                cluster_total: ResourceList::new(),
                quota_infos,
                children,
            }),
        }
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, ManagerInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, ManagerInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_version(&self) {
        self.tree_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Set the pool fanned out at the root. Runtime vectors are recomputed
    /// lazily on the next refresh.
    pub fn update_cluster_total_resource(&self, total: ResourceList) {
        {
            let mut inner = self.write_inner();
            debug!(tree = %self.tree_id, total = %total, "cluster total resource updated");
            inner.cluster_total = total;
        }
        self.bump_version();
    }

    pub fn get_cluster_total_resource(&self) -> ResourceList {
        self.read_inner().cluster_total.clone()
    }

    pub fn get_quota_info(&self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.read_inner().quota_infos.get(name).cloned()
    }

    pub fn has_quota(&self, name: &str) -> bool {
        self.read_inner().quota_infos.contains_key(name)
    }

    /// All group names in this tree, the root included.
    pub fn get_all_quota_names(&self) -> Vec<String> {
        self.read_inner().quota_infos.keys().cloned().collect()
    }

    pub fn quota_has_pods(&self, name: &str) -> bool {
        self.read_inner()
            .quota_infos
            .get(name)
            .map(|qi| qi.has_pods())
            .unwrap_or(false)
    }

    pub fn children_of(&self, name: &str) -> Vec<String> {
        self.read_inner()
            .children
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The quota itself followed by its ancestors up to the root,
    /// ancestor-most last.
    fn chain_to_root(inner: &ManagerInner, start: &str) -> Vec<Arc<QuotaInfo>> {
        let mut chain = Vec::new();
        let mut cursor = start.to_string();
        while let Some(qi) = inner.quota_infos.get(&cursor) {
            chain.push(qi.clone());
            let parent = qi.parent_name();
            if parent.is_empty() {
                break;
            }
            if chain.len() > MAX_TREE_DEPTH {
                error!(quota = start, "BUG: parent chain exceeds maximum depth, tree desynchronized");
                break;
            }
            cursor = parent;
        }
        chain
    }

    /// Apply a delta to `start` and every ancestor, root first.
    fn propagate_delta(inner: &ManagerInner, start: &str, delta: &QuotaDelta) {
        if delta.is_zero() {
            return;
        }
        let chain = Self::chain_to_root(inner, start);
        for qi in chain.iter().rev() {
            qi.apply_delta(delta);
        }
    }

    pub fn add_quota(&self, meta: QuotaMeta) -> Result<()> {
        {
            let mut inner = self.write_inner();
            if inner.quota_infos.contains_key(&meta.name) {
                return Err(QuotaError::AlreadyExists(meta.name));
            }
            if !inner.quota_infos.contains_key(&meta.parent_name) {
                return Err(QuotaError::NotFound(meta.parent_name));
            }
            let name = meta.name.clone();
            let parent = meta.parent_name.clone();
            inner
                .quota_infos
                .insert(name.clone(), Arc::new(QuotaInfo::new(meta)));
            inner.children.entry(name.clone()).or_default();
            inner.children.entry(parent).or_default().insert(name);
        }
        self.bump_version();
        Ok(())
    }

    pub fn delete_quota(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.write_inner();
            let qi = inner
                .quota_infos
                .get(name)
                .cloned()
                .ok_or_else(|| QuotaError::NotFound(name.to_string()))?;
            match inner.children.get(name) {
                Some(children) if !children.is_empty() => {
                    return Err(QuotaError::HasChildren(name.to_string()));
                }
                Some(_) => {}
                None => return Err(QuotaError::OutOfSync(name.to_string())),
            }
            if qi.has_pods() {
                return Err(QuotaError::HasPods(name.to_string()));
            }

            // A deletable leaf holds no pods, but subtract any residue so a
            // missed event can never leak into the ancestors.
            let residue = qi.aggregate_delta();
            if !residue.is_zero() {
                warn!(quota = name, "deleting quota with non-zero aggregates");
                Self::propagate_delta(&inner, &qi.parent_name(), &residue.negated());
            }

            let parent = qi.parent_name();
            if let Some(siblings) = inner.children.get_mut(&parent) {
                siblings.remove(name);
            }
            inner.children.remove(name);
            inner.quota_infos.remove(name);
        }
        self.bump_version();
        Ok(())
    }

    /// Apply a validated update: governed-field changes and, when the parent
    /// changed, an atomic reparent that moves the group's whole aggregate
    /// contribution from the old ancestor chain to the new one.
    pub fn update_quota(&self, meta: QuotaMeta) -> Result<()> {
        {
            let inner = self.write_inner();
            let qi = inner
                .quota_infos
                .get(&meta.name)
                .cloned()
                .ok_or_else(|| QuotaError::NotFound(meta.name.clone()))?;
            let old_parent = qi.parent_name();
            if old_parent != meta.parent_name {
                if !inner.quota_infos.contains_key(&meta.parent_name) {
                    return Err(QuotaError::NotFound(meta.parent_name));
                }
                let contribution = qi.aggregate_delta();
                Self::propagate_delta(&inner, &old_parent, &contribution.negated());
                Self::propagate_delta(&inner, &meta.parent_name, &contribution);
            }
            qi.update_meta(&meta);
            let mut inner = inner;
            if let Some(old_siblings) = inner.children.get_mut(&old_parent) {
                old_siblings.remove(&meta.name);
            }
            inner
                .children
                .entry(meta.parent_name.clone())
                .or_default()
                .insert(meta.name.clone());
        }
        self.bump_version();
        Ok(())
    }

    pub(crate) fn set_quota_is_parent(&self, name: &str, is_parent: bool) {
        if let Some(qi) = self.get_quota_info(name) {
            qi.set_is_parent(is_parent);
        }
    }

    /// Charge a pod to `quota_name`. Idempotent per pod uid.
    pub fn on_pod_add(&self, quota_name: &str, pod: Arc<Pod>) -> Result<()> {
        let uid = api_types::pod_uid(&pod).to_string();
        if uid.is_empty() {
            return Err(QuotaError::InvalidObject("pod has no uid".to_string()));
        }
        let inner = self.read_inner();
        let qi = inner
            .quota_infos
            .get(quota_name)
            .ok_or_else(|| QuotaError::NotFound(quota_name.to_string()))?;
        let info = PodInfo::from_pod(pod);
        {
            let mut state = qi.write();
            if state.pod_cache.contains_key(&uid) {
                return Ok(());
            }
            state.pod_cache.insert(uid, info.clone());
        }
        let delta = QuotaDelta::for_pod(&info);
        let request_changed = !delta.request.is_zero();
        Self::propagate_delta(&inner, quota_name, &delta);
        drop(inner);
        if request_changed {
            self.bump_version();
        }
        Ok(())
    }

    /// Apply a pod change. The cached entry, not the caller's old object, is
    /// the subtraction base, so a missed earlier event cannot skew the
    /// aggregates.
    pub fn on_pod_update(&self, quota_name: &str, new_pod: Arc<Pod>) -> Result<()> {
        let uid = api_types::pod_uid(&new_pod).to_string();
        let inner = self.read_inner();
        let qi = inner
            .quota_infos
            .get(quota_name)
            .ok_or_else(|| QuotaError::NotFound(quota_name.to_string()))?;
        let new_info = PodInfo::from_pod(new_pod);
        let old_info = {
            let mut state = qi.write();
            state.pod_cache.insert(uid, new_info.clone())
        };
        let mut delta = QuotaDelta::for_pod(&new_info);
        if let Some(old_info) = old_info {
            let old_delta = QuotaDelta::for_pod(&old_info).negated();
            delta.request.add_assign(&old_delta.request);
            delta.used.add_assign(&old_delta.used);
            delta
                .non_preemptible_request
                .add_assign(&old_delta.non_preemptible_request);
            delta
                .non_preemptible_used
                .add_assign(&old_delta.non_preemptible_used);
            delta.allocated.add_assign(&old_delta.allocated);
        }
        let request_changed = !delta.request.is_zero();
        Self::propagate_delta(&inner, quota_name, &delta);
        drop(inner);
        if request_changed {
            self.bump_version();
        }
        Ok(())
    }

    /// Remove a pod's contribution. Unknown pods are ignored for
    /// idempotency; the return value says whether the pod was cached here.
    pub fn on_pod_delete(&self, quota_name: &str, pod: &Pod) -> Result<bool> {
        let uid = api_types::pod_uid(pod);
        let inner = self.read_inner();
        let qi = inner
            .quota_infos
            .get(quota_name)
            .ok_or_else(|| QuotaError::NotFound(quota_name.to_string()))?;
        let removed = {
            let mut state = qi.write();
            state.pod_cache.remove(uid)
        };
        let Some(info) = removed else {
            return Ok(false);
        };
        let delta = QuotaDelta::for_pod(&info).negated();
        let request_changed = !delta.request.is_zero();
        Self::propagate_delta(&inner, quota_name, &delta);
        drop(inner);
        if request_changed {
            self.bump_version();
        }
        Ok(true)
    }

    /// Mark a pod as assigned; Used counts it from here on whether or not
    /// its phase is Running yet.
    pub fn reserve_pod(&self, quota_name: &str, pod: &Pod) -> Result<()> {
        self.set_pod_assigned(quota_name, api_types::pod_uid(pod), true)
    }

    /// Exact reverse of [`Self::reserve_pod`].
    pub fn unreserve_pod(&self, quota_name: &str, pod: &Pod) -> Result<()> {
        self.set_pod_assigned(quota_name, api_types::pod_uid(pod), false)
    }

    fn set_pod_assigned(&self, quota_name: &str, uid: &str, is_assigned: bool) -> Result<()> {
        let inner = self.read_inner();
        let qi = inner
            .quota_infos
            .get(quota_name)
            .ok_or_else(|| QuotaError::NotFound(quota_name.to_string()))?;
        let delta = {
            let mut state = qi.write();
            let Some(info) = state.pod_cache.get_mut(uid) else {
                return Err(QuotaError::NotFound(format!("pod {uid} in quota {quota_name}")));
            };
            if info.is_assigned == is_assigned {
                return Ok(());
            }
            info.is_assigned = is_assigned;
            let mut delta = QuotaDelta {
                used: info.request.clone(),
                allocated: info.request.clone(),
                ..Default::default()
            };
            if info.is_non_preemptible {
                delta.non_preemptible_used = info.request.clone();
            }
            if is_assigned {
                delta
            } else {
                delta.negated()
            }
        };
        Self::propagate_delta(&inner, quota_name, &delta);
        Ok(())
    }

    /// Move a cached pod between two groups of this tree as one atomic
    /// operation under the manager lock.
    pub fn migrate_pod(&self, from: &str, to: &str, uid: &str) -> Result<()> {
        {
            let inner = self.write_inner();
            let from_qi = inner
                .quota_infos
                .get(from)
                .ok_or_else(|| QuotaError::NotFound(from.to_string()))?;
            let to_qi = inner
                .quota_infos
                .get(to)
                .ok_or_else(|| QuotaError::NotFound(to.to_string()))?;
            let info = {
                let mut state = from_qi.write();
                state
                    .pod_cache
                    .remove(uid)
                    .ok_or_else(|| QuotaError::NotFound(format!("pod {uid} in quota {from}")))?
            };
            let delta = QuotaDelta::for_pod(&info);
            Self::propagate_delta(&inner, from, &delta.negated());
            {
                let mut state = to_qi.write();
                state.pod_cache.insert(uid.to_string(), info);
            }
            Self::propagate_delta(&inner, to, &delta);
        }
        self.bump_version();
        Ok(())
    }

    /// Recompute (or fetch, when current) the runtime vector for `name`.
    ///
    /// The walk starts at the root, whose runtime is the cluster total, and
    /// redistributes each level's runtime to its children until the target
    /// level is current. Idempotent and cheap when nothing changed.
    pub fn refresh_runtime(&self, name: &str) -> Option<ResourceList> {
        let inner = self.read_inner();
        let qi = inner.quota_infos.get(name)?;
        if !self.enable_runtime_quota {
            return Some(qi.get_max());
        }
        if name == ROOT_QUOTA_NAME {
            return Some(inner.cluster_total.clone());
        }
        let version = self.tree_version.load(Ordering::SeqCst);
        if let Some(runtime) = qi.runtime_if_current(version) {
            return Some(runtime);
        }

        let chain = Self::chain_to_root(&inner, name);
        // Walk down from the root: refresh each level whose target child is
        // stale by redistributing the parent's runtime to all its children.
        for pair in chain.windows(2).rev() {
            let (child, parent) = (&pair[0], &pair[1]);
            if child.runtime_if_current(version).is_some() {
                continue;
            }
            let parent_runtime = if parent.name() == ROOT_QUOTA_NAME {
                inner.cluster_total.clone()
            } else {
                match parent.runtime_if_current(version) {
                    Some(runtime) => runtime,
                    None => {
                        error!(
                            quota = parent.name(),
                            "BUG: parent runtime stale after top-down refresh"
                        );
                        return None;
                    }
                }
            };
            let Some(child_names) = inner.children.get(parent.name()) else {
                error!(quota = parent.name(), "BUG: parent missing from hierarchy map");
                return None;
            };
            let child_quotas: Vec<ChildQuota> = child_names
                .iter()
                .filter_map(|child_name| inner.quota_infos.get(child_name))
                .map(|child_qi| ChildQuota {
                    name: child_qi.name().to_string(),
                    min: child_qi.get_min(),
                    max: child_qi.get_max(),
                    shared_weight: child_qi.get_shared_weight(),
                    request: child_qi.get_request(),
                    allow_lent_resource: child_qi.allow_lent_resource(),
                })
                .collect();
            let runtimes = calculate_child_runtimes(&parent_runtime, &child_quotas);
            for (child_name, runtime) in runtimes {
                if let Some(child_qi) = inner.quota_infos.get(&child_name) {
                    child_qi.set_runtime(runtime, version);
                }
            }
        }

        qi.runtime_if_current(version)
    }
}
