//! Index of per-tree managers.
//!
//! Quota trees are partitioned by tree id; each tree owns a disjoint
//! resource pool and its own [`GroupQuotaManager`]. The registry routes
//! structural and accounting operations to the right manager and keeps the
//! quota-name to tree-id mapping that pod events resolve through. Accounting
//! of one tree never spills into another.

use std::sync::Arc;

use dashmap::DashMap;

use super::group_quota_manager::GroupQuotaManager;

/// Tree id of the default tree (quotas with no tree-id label).
pub const DEFAULT_TREE_ID: &str = "";

pub struct QuotaManagerRegistry {
    enable_runtime_quota: bool,
    managers: DashMap<String, Arc<GroupQuotaManager>>,
    quota_to_tree: DashMap<String, String>,
}

impl QuotaManagerRegistry {
    pub fn new(enable_runtime_quota: bool) -> Self {
        let registry = Self {
            enable_runtime_quota,
            managers: DashMap::new(),
            quota_to_tree: DashMap::new(),
        };
        registry.managers.insert(
            DEFAULT_TREE_ID.to_string(),
            Arc::new(GroupQuotaManager::new(DEFAULT_TREE_ID, enable_runtime_quota)),
        );
        registry
    }

    pub fn default_manager(&self) -> Arc<GroupQuotaManager> {
        self.managers
            .get(DEFAULT_TREE_ID)
            .expect("default tree manager exists from construction")
            .clone()
    }

    pub fn manager_for_tree(&self, tree_id: &str) -> Option<Arc<GroupQuotaManager>> {
        self.managers.get(tree_id).map(|entry| entry.clone())
    }

    pub fn get_or_create_manager(&self, tree_id: &str) -> Arc<GroupQuotaManager> {
        self.managers
            .entry(tree_id.to_string())
            .or_insert_with(|| {
                Arc::new(GroupQuotaManager::new(tree_id, self.enable_runtime_quota))
            })
            .clone()
    }

    /// Record which tree a quota lives in. Called after the manager accepted
    /// the add.
    pub fn register_quota(&self, quota_name: &str, tree_id: &str) {
        self.quota_to_tree
            .insert(quota_name.to_string(), tree_id.to_string());
    }

    pub fn unregister_quota(&self, quota_name: &str) {
        self.quota_to_tree.remove(quota_name);
    }

    pub fn tree_for_quota(&self, quota_name: &str) -> Option<String> {
        self.quota_to_tree.get(quota_name).map(|entry| entry.clone())
    }

    pub fn has_quota(&self, quota_name: &str) -> bool {
        self.quota_to_tree.contains_key(quota_name)
    }

    /// Manager owning `quota_name`, if the quota is known.
    pub fn manager_for_quota(&self, quota_name: &str) -> Option<Arc<GroupQuotaManager>> {
        let tree = self.tree_for_quota(quota_name)?;
        self.manager_for_tree(&tree)
    }

    pub fn tree_ids(&self) -> Vec<String> {
        self.managers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quota_info::QuotaMeta;
    use api_types::{ResourceList, RESOURCE_CPU};

    fn meta(name: &str, tree: &str) -> QuotaMeta {
        QuotaMeta {
            name: name.to_string(),
            parent_name: "root".to_string(),
            tree_id: tree.to_string(),
            is_parent: false,
            allow_lent_resource: true,
            min: ResourceList::new(),
            max: ResourceList::new().with(RESOURCE_CPU, 10_000),
            shared_weight: ResourceList::new().with(RESOURCE_CPU, 10_000),
        }
    }

    #[test]
    fn routes_quotas_to_their_tree() {
        let registry = QuotaManagerRegistry::new(true);
        let default_manager = registry.default_manager();
        let tree_manager = registry.get_or_create_manager("tree-1");

        default_manager.add_quota(meta("a", "")).unwrap();
        registry.register_quota("a", "");
        tree_manager.add_quota(meta("b", "tree-1")).unwrap();
        registry.register_quota("b", "tree-1");

        assert_eq!(registry.tree_for_quota("a").as_deref(), Some(""));
        assert_eq!(registry.tree_for_quota("b").as_deref(), Some("tree-1"));
        assert!(registry.manager_for_quota("b").unwrap().has_quota("b"));
        assert!(!registry.manager_for_quota("a").unwrap().has_quota("b"));
        assert!(registry.manager_for_quota("missing").is_none());
    }

    #[test]
    fn trees_have_disjoint_pools() {
        let registry = QuotaManagerRegistry::new(true);
        let default_manager = registry.default_manager();
        let tree_manager = registry.get_or_create_manager("tree-1");

        default_manager
            .update_cluster_total_resource(ResourceList::new().with(RESOURCE_CPU, 10_000));
        tree_manager
            .update_cluster_total_resource(ResourceList::new().with(RESOURCE_CPU, 50_000));

        assert_eq!(
            default_manager.get_cluster_total_resource().get(RESOURCE_CPU),
            10_000
        );
        assert_eq!(
            tree_manager.get_cluster_total_resource().get(RESOURCE_CPU),
            50_000
        );
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = QuotaManagerRegistry::new(false);
        let first = registry.get_or_create_manager("tree-1");
        let second = registry.get_or_create_manager("tree-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tree_id(), "tree-1");
        assert_eq!(registry.tree_ids().len(), 2);
    }
}
