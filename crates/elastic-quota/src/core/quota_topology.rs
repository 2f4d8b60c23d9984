//! Validator and index of the quota group forest.
//!
//! The topology owns the authoritative structural view: name map, adjacency
//! and namespace bindings across all trees. Every structural change is
//! validated and applied here before the per-tree manager mutates its
//! accounting state. One coarse lock covers validation and application; all
//! operations on it are brief map work.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use api_types::{
    ElasticQuota, ResourceList, ANNOTATION_SHARED_WEIGHT, DEFAULT_QUOTA_NAME, LABEL_QUOTA_PARENT,
    LABEL_QUOTA_TREE_ID, ROOT_QUOTA_NAME, SYSTEM_QUOTA_NAME,
};
use serde::Serialize;
use tracing::debug;

use super::error::{QuotaError, Result};
use super::quota_info::QuotaMeta;

/// Collaborator-supplied probe answering whether any pod still references a
/// quota group. In production this is backed by the scheduler's pod caches.
pub trait PodProbe {
    fn quota_has_pods(&self, quota_name: &str) -> bool;
}

/// Outcome of a successful add: the validated meta, and whether the parent
/// was a pod-less leaf that had to become a parent group.
#[derive(Debug)]
pub struct AddOutcome {
    pub meta: QuotaMeta,
    pub parent_flipped: bool,
}

/// Outcome of a successful update.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub meta: QuotaMeta,
    pub old_parent: String,
    pub parent_flipped: bool,
}

#[derive(Default)]
struct TopologyInner {
    quotas: HashMap<String, QuotaMeta>,
    children: HashMap<String, BTreeSet<String>>,
    namespace_to_quota: HashMap<String, String>,
}

pub struct QuotaTopology {
    /// Strict mode: the Min sum of a parent's children may not exceed the
    /// parent's Min in any dimension.
    enable_min_quota_sum_check: bool,
    inner: Mutex<TopologyInner>,
}

impl QuotaTopology {
    pub fn new(enable_min_quota_sum_check: bool) -> Self {
        let mut inner = TopologyInner::default();
        inner
            .children
            .insert(ROOT_QUOTA_NAME.to_string(), BTreeSet::new());
        Self {
            enable_min_quota_sum_check,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopologyInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill a quota object with defaults before validation: parent `root`
    /// when missing, tree id inherited from the parent, shared weight
    /// defaulting to Max.
    pub fn fill_defaults(&self, quota: &mut ElasticQuota) -> Result<()> {
        let name = api_types::quota_name(quota).to_string();
        if name == ROOT_QUOTA_NAME {
            return Ok(());
        }

        let inner = self.lock();
        let labels = quota.metadata.labels.get_or_insert_with(BTreeMap::new);
        let parent = labels
            .entry(LABEL_QUOTA_PARENT.to_string())
            .or_insert_with(|| ROOT_QUOTA_NAME.to_string())
            .clone();

        let tree_unset = labels
            .get(LABEL_QUOTA_TREE_ID)
            .map(String::is_empty)
            .unwrap_or(true);
        if tree_unset && parent != ROOT_QUOTA_NAME {
            let parent_meta = inner.quotas.get(&parent).ok_or_else(|| {
                QuotaError::InvalidQuota {
                    name: name.clone(),
                    message: format!("parent {parent} does not exist"),
                }
            })?;
            if !parent_meta.tree_id.is_empty() {
                labels.insert(LABEL_QUOTA_TREE_ID.to_string(), parent_meta.tree_id.clone());
            }
        }
        drop(inner);

        let annotations = quota.metadata.annotations.get_or_insert_with(BTreeMap::new);
        let weight_unset = annotations
            .get(ANNOTATION_SHARED_WEIGHT)
            .map(String::is_empty)
            .unwrap_or(true);
        if weight_unset {
            let max_json = serde_json::to_string(&quota.spec.max)
                .map_err(|e| QuotaError::InvalidObject(e.to_string()))?;
            annotations.insert(ANNOTATION_SHARED_WEIGHT.to_string(), max_json);
            debug!(quota = %name, "filled shared weight from max");
        }
        Ok(())
    }

    /// Validate and apply an Add. On success the group is inserted into the
    /// name map, the adjacency and the namespace bindings.
    pub fn valid_add_quota(&self, quota: &ElasticQuota, pods: &dyn PodProbe) -> Result<AddOutcome> {
        let meta = QuotaMeta::from_quota(quota)?;
        let namespaces = api_types::quota_namespaces(quota);

        let mut inner = self.lock();
        if inner.quotas.contains_key(&meta.name) {
            return Err(QuotaError::AlreadyExists(meta.name));
        }
        for namespace in &namespaces {
            if let Some(bound) = inner.namespace_to_quota.get(namespace) {
                return Err(QuotaError::NamespaceAlreadyBound {
                    namespace: namespace.clone(),
                    quota: bound.clone(),
                });
            }
        }
        Self::validate_self(&meta)?;
        let parent_flipped = self.validate_hierarchy(&inner, &meta, None)?;
        if parent_flipped && pods.quota_has_pods(&meta.parent_name) {
            return Err(QuotaError::InvalidQuota {
                name: meta.name,
                message: format!("parent {} is a leaf group with pods", meta.parent_name),
            });
        }

        if parent_flipped {
            if let Some(parent_meta) = inner.quotas.get_mut(&meta.parent_name) {
                parent_meta.is_parent = true;
            }
        }
        inner.quotas.insert(meta.name.clone(), meta.clone());
        inner.children.entry(meta.name.clone()).or_default();
        inner
            .children
            .entry(meta.parent_name.clone())
            .or_default()
            .insert(meta.name.clone());
        for namespace in namespaces {
            inner.namespace_to_quota.insert(namespace, meta.name.clone());
        }
        Ok(AddOutcome { meta, parent_flipped })
    }

    /// Validate and apply an Update. Returns `None` when none of the
    /// governed fields changed (idempotent no-op).
    pub fn valid_update_quota(
        &self,
        old_quota: Option<&ElasticQuota>,
        new_quota: &ElasticQuota,
        pods: &dyn PodProbe,
    ) -> Result<Option<UpdateOutcome>> {
        if let Some(old_quota) = old_quota {
            if quota_fields_equal(old_quota, new_quota) {
                return Ok(None);
            }
        }

        let meta = QuotaMeta::from_quota(new_quota)?;
        if is_reserved_name(&meta.name) {
            return Err(QuotaError::ForbiddenModify(meta.name));
        }
        let namespaces = api_types::quota_namespaces(new_quota);

        let mut inner = self.lock();
        let old_meta = inner
            .quotas
            .get(&meta.name)
            .cloned()
            .ok_or_else(|| QuotaError::NotFound(meta.name.clone()))?;

        // Replayed add-as-update with no old object: idempotent success.
        if old_quota.is_none() && meta == old_meta {
            return Ok(None);
        }

        // A group never moves across trees once placed.
        if old_meta.tree_id != meta.tree_id {
            return Err(QuotaError::ForbiddenModify(format!(
                "{}: tree id may not change ({} -> {})",
                meta.name, old_meta.tree_id, meta.tree_id
            )));
        }
        for namespace in &namespaces {
            if let Some(bound) = inner.namespace_to_quota.get(namespace) {
                if bound != &meta.name {
                    return Err(QuotaError::NamespaceAlreadyBound {
                        namespace: namespace.clone(),
                        quota: bound.clone(),
                    });
                }
            }
        }
        Self::validate_self(&meta)?;
        let parent_flipped = self.validate_hierarchy(&inner, &meta, Some(&old_meta))?;
        if parent_flipped && pods.quota_has_pods(&meta.parent_name) {
            return Err(QuotaError::InvalidQuota {
                name: meta.name,
                message: format!("parent {} is a leaf group with pods", meta.parent_name),
            });
        }

        // Flipping parent -> leaf needs an empty subtree; flipping
        // leaf -> parent needs an empty pod cache.
        if old_meta.is_parent && !meta.is_parent {
            if let Some(children) = inner.children.get(&meta.name) {
                if !children.is_empty() {
                    return Err(QuotaError::InvalidQuota {
                        name: meta.name,
                        message: "cannot become a leaf while child quotas exist".to_string(),
                    });
                }
            }
        }
        if !old_meta.is_parent && meta.is_parent && pods.quota_has_pods(&meta.name) {
            return Err(QuotaError::InvalidQuota {
                name: meta.name,
                message: "cannot become a parent while pods are cached".to_string(),
            });
        }

        if parent_flipped {
            if let Some(parent_meta) = inner.quotas.get_mut(&meta.parent_name) {
                parent_meta.is_parent = true;
            }
        }
        if old_meta.parent_name != meta.parent_name {
            if let Some(old_siblings) = inner.children.get_mut(&old_meta.parent_name) {
                old_siblings.remove(&meta.name);
            }
            inner
                .children
                .entry(meta.parent_name.clone())
                .or_default()
                .insert(meta.name.clone());
        }
        inner.quotas.insert(meta.name.clone(), meta.clone());

        let released: Vec<String> = inner
            .namespace_to_quota
            .iter()
            .filter(|(_, quota)| *quota == &meta.name)
            .map(|(namespace, _)| namespace.clone())
            .collect();
        for namespace in released {
            inner.namespace_to_quota.remove(&namespace);
        }
        for namespace in namespaces {
            inner.namespace_to_quota.insert(namespace, meta.name.clone());
        }

        Ok(Some(UpdateOutcome {
            old_parent: old_meta.parent_name,
            meta,
            parent_flipped,
        }))
    }

    /// Validate and apply a Delete. Reserved groups, groups with children
    /// and groups that still own pods are refused.
    pub fn valid_delete_quota(&self, quota_name: &str, pods: &dyn PodProbe) -> Result<()> {
        if is_reserved_name(quota_name) || quota_name == ROOT_QUOTA_NAME {
            return Err(QuotaError::ForbiddenDelete(quota_name.to_string()));
        }
        let mut inner = self.lock();
        let meta = inner
            .quotas
            .get(quota_name)
            .cloned()
            .ok_or_else(|| QuotaError::NotFound(quota_name.to_string()))?;
        match inner.children.get(quota_name) {
            Some(children) if !children.is_empty() => {
                return Err(QuotaError::HasChildren(quota_name.to_string()));
            }
            Some(_) => {}
            None => return Err(QuotaError::OutOfSync(quota_name.to_string())),
        }
        if pods.quota_has_pods(quota_name) {
            return Err(QuotaError::HasPods(quota_name.to_string()));
        }

        if let Some(siblings) = inner.children.get_mut(&meta.parent_name) {
            siblings.remove(quota_name);
        }
        inner.children.remove(quota_name);
        inner.quotas.remove(quota_name);
        inner
            .namespace_to_quota
            .retain(|_, quota| quota != quota_name);
        Ok(())
    }

    /// Resolve a quota by name, falling back to the namespace binding.
    pub fn get_quota_name(&self, name: &str, namespace: &str) -> Option<String> {
        let inner = self.lock();
        if inner.quotas.contains_key(name) {
            return Some(name.to_string());
        }
        inner.namespace_to_quota.get(namespace).cloned()
    }

    /// Quota bound to a namespace, if any.
    pub fn quota_for_namespace(&self, namespace: &str) -> Option<String> {
        self.lock().namespace_to_quota.get(namespace).cloned()
    }

    pub fn contains_quota(&self, name: &str) -> bool {
        self.lock().quotas.contains_key(name)
    }

    /// Serializable dump of the forest for debugging endpoints.
    pub fn summary(&self) -> TopologySummary {
        let inner = self.lock();
        TopologySummary {
            quotas: inner
                .quotas
                .iter()
                .map(|(name, meta)| {
                    (
                        name.clone(),
                        QuotaSummary {
                            parent: meta.parent_name.clone(),
                            tree_id: meta.tree_id.clone(),
                            is_parent: meta.is_parent,
                            min: meta.min.clone(),
                            max: meta.max.clone(),
                        },
                    )
                })
                .collect(),
            hierarchy: inner
                .children
                .iter()
                .map(|(name, children)| (name.clone(), children.iter().cloned().collect()))
                .collect(),
        }
    }

    fn validate_self(meta: &QuotaMeta) -> Result<()> {
        if meta.name.is_empty() {
            return Err(QuotaError::InvalidObject("quota has no name".to_string()));
        }
        if meta.name == ROOT_QUOTA_NAME {
            return Err(QuotaError::InvalidQuota {
                name: meta.name.clone(),
                message: "the root group is implicit and cannot be created".to_string(),
            });
        }
        let (fits, exceeded) = meta.min.less_equal_strict(&meta.max);
        if !fits {
            return Err(QuotaError::InvalidQuota {
                name: meta.name.clone(),
                message: format!(
                    "min {} exceeds max {} on dimensions {exceeded:?}",
                    meta.min, meta.max
                ),
            });
        }
        if meta.shared_weight.iter().any(|(_, weight)| weight < 0) {
            return Err(QuotaError::InvalidQuota {
                name: meta.name.clone(),
                message: format!("shared weight {} has a negative dimension", meta.shared_weight),
            });
        }
        Ok(())
    }

    /// Hierarchy checks against the prospective tree. Returns whether the
    /// parent is a pod-less leaf that will be flipped to a parent group.
    fn validate_hierarchy(
        &self,
        inner: &TopologyInner,
        meta: &QuotaMeta,
        old_meta: Option<&QuotaMeta>,
    ) -> Result<bool> {
        if meta.parent_name == meta.name {
            return Err(QuotaError::InvalidQuota {
                name: meta.name.clone(),
                message: "quota cannot be its own parent".to_string(),
            });
        }

        let mut parent_flipped = false;
        if meta.parent_name != ROOT_QUOTA_NAME {
            let parent = inner.quotas.get(&meta.parent_name).ok_or_else(|| {
                QuotaError::InvalidQuota {
                    name: meta.name.clone(),
                    message: format!("parent {} does not exist", meta.parent_name),
                }
            })?;
            if parent.tree_id != meta.tree_id {
                return Err(QuotaError::InvalidQuota {
                    name: meta.name.clone(),
                    message: format!(
                        "parent {} belongs to tree {:?}, quota to tree {:?}",
                        meta.parent_name, parent.tree_id, meta.tree_id
                    ),
                });
            }
            parent_flipped = !parent.is_parent;

            // The new parent chain must reach the root without meeting the
            // quota itself.
            let mut seen = HashSet::new();
            let mut cursor = meta.parent_name.clone();
            while cursor != ROOT_QUOTA_NAME {
                if cursor == meta.name || !seen.insert(cursor.clone()) {
                    return Err(QuotaError::InvalidQuota {
                        name: meta.name.clone(),
                        message: format!("parent {} would create a cycle", meta.parent_name),
                    });
                }
                cursor = match inner.quotas.get(&cursor) {
                    Some(ancestor) => ancestor.parent_name.clone(),
                    None => return Err(QuotaError::OutOfSync(cursor)),
                };
            }

            if self.enable_min_quota_sum_check {
                let mut sibling_min_sum = meta.min.clone();
                if let Some(siblings) = inner.children.get(&meta.parent_name) {
                    for sibling in siblings {
                        if sibling == &meta.name {
                            continue;
                        }
                        if let Some(sibling_meta) = inner.quotas.get(sibling) {
                            sibling_min_sum.add_assign(&sibling_meta.min);
                        }
                    }
                }
                let (fits, exceeded) = sibling_min_sum.less_equal_strict(&parent.min);
                if !fits {
                    return Err(QuotaError::InvalidQuota {
                        name: meta.name.clone(),
                        message: format!(
                            "children min sum {} exceeds parent {} min {} on dimensions {exceeded:?}",
                            sibling_min_sum, meta.parent_name, parent.min
                        ),
                    });
                }
            }
        }

        // Ignore a parent flip that is not a change (updates keeping the
        // same parent).
        if let Some(old_meta) = old_meta {
            if old_meta.parent_name == meta.parent_name {
                parent_flipped = false;
            }
        }
        Ok(parent_flipped)
    }
}

fn is_reserved_name(name: &str) -> bool {
    name == DEFAULT_QUOTA_NAME || name == SYSTEM_QUOTA_NAME || name == ROOT_QUOTA_NAME
}

/// Compare the governed fields of two quota objects: labels and annotations
/// the engine consumes, plus the Min/Max spec. Anything else (status,
/// managed fields, unrelated metadata) does not constitute a change.
pub fn quota_fields_equal(old: &ElasticQuota, new: &ElasticQuota) -> bool {
    let labels = [
        LABEL_QUOTA_PARENT,
        LABEL_QUOTA_TREE_ID,
        api_types::LABEL_QUOTA_IS_PARENT,
        api_types::LABEL_QUOTA_IS_ROOT,
        api_types::LABEL_ALLOW_LENT_RESOURCE,
    ];
    let annotations = [
        ANNOTATION_SHARED_WEIGHT,
        api_types::ANNOTATION_TOTAL_RESOURCE,
        api_types::ANNOTATION_QUOTA_NAMESPACES,
    ];
    let label_of = |quota: &ElasticQuota, key: &str| {
        quota
            .metadata
            .labels
            .as_ref()
            .and_then(|m| m.get(key))
            .cloned()
    };
    let annotation_of = |quota: &ElasticQuota, key: &str| {
        quota
            .metadata
            .annotations
            .as_ref()
            .and_then(|m| m.get(key))
            .cloned()
    };
    labels
        .iter()
        .all(|key| label_of(old, key) == label_of(new, key))
        && annotations
            .iter()
            .all(|key| annotation_of(old, key) == annotation_of(new, key))
        && old.spec.max == new.spec.max
        && old.spec.min == new.spec.min
}

#[derive(Debug, Serialize)]
pub struct QuotaSummary {
    pub parent: String,
    pub tree_id: String,
    pub is_parent: bool,
    pub min: ResourceList,
    pub max: ResourceList,
}

#[derive(Debug, Serialize)]
pub struct TopologySummary {
    pub quotas: HashMap<String, QuotaSummary>,
    pub hierarchy: HashMap<String, Vec<String>>,
}
