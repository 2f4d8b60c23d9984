//! Background migration of mis-routed pods.
//!
//! Pods whose quota group did not exist when they arrived sit in the
//! `default` group. A periodic pass re-resolves every pod cached there and
//! moves the ones whose target group has appeared, each as one atomic
//! remove/add under the manager lock. The loop honors the scheduler's
//! shutdown signal and aborts between pods.

use std::sync::Arc;

use api_types::DEFAULT_QUOTA_NAME;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Plugin;

impl Plugin {
    /// Run the background reconciler until cancellation. Waits out the
    /// configured startup grace period first so informer replay settles.
    pub async fn run_migrate_loop(self: Arc<Self>, cancellation_token: CancellationToken) {
        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            _ = tokio::time::sleep(self.args().delay_evict_time()) => {}
        }

        let mut ticker = tokio::time::interval(self.args().revoke_pod_interval());
        info!(
            interval = ?self.args().revoke_pod_interval(),
            "starting default quota group migration loop"
        );
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("migration loop shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.migrate_default_quota_group_pods(&cancellation_token);
                }
            }
        }
    }

    /// One migration pass over the default group's pod cache.
    pub fn migrate_default_quota_group_pods(&self, cancellation_token: &CancellationToken) {
        let default_manager = self.registry().default_manager();
        let Some(default_info) = default_manager.get_quota_info(DEFAULT_QUOTA_NAME) else {
            return;
        };

        for (uid, pod_info) in default_info.pods() {
            if cancellation_token.is_cancelled() {
                return;
            }
            let target = self.get_pod_associate_quota_name(&pod_info.pod);
            if target == DEFAULT_QUOTA_NAME {
                continue;
            }
            let Some(target_manager) = self.registry().manager_for_quota(&target) else {
                continue;
            };

            let result = if Arc::ptr_eq(&target_manager, &default_manager) {
                default_manager.migrate_pod(DEFAULT_QUOTA_NAME, &target, &uid)
            } else {
                // The target lives in another tree: a paired remove/add.
                default_manager
                    .on_pod_delete(DEFAULT_QUOTA_NAME, &pod_info.pod)
                    .and_then(|_| target_manager.on_pod_add(&target, pod_info.pod.clone()))
            };
            match result {
                Ok(_) => info!(pod = %uid, quota = %target, "migrated pod out of default quota group"),
                Err(e) => warn!(pod = %uid, quota = %target, error = %e, "pod migration failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElasticQuotaArgs;
    use crate::plugin::test_util::*;
    use api_types::{ResourceList, ROOT_QUOTA_NAME};

    #[test]
    fn pods_move_once_their_group_appears() {
        let plugin = Plugin::new(ElasticQuotaArgs::default());
        let manager = plugin.registry().default_manager();

        // four pods arrive before their quota exists and land in default
        for i in 1..=4 {
            plugin
                .on_pod_add(&make_pod(&i.to_string(), Some("team-late"), "10", "10"))
                .unwrap();
        }
        let default_info = manager.get_quota_info(api_types::DEFAULT_QUOTA_NAME).unwrap();
        assert_eq!(default_info.pod_cache_len(), 4);

        plugin
            .on_quota_add(&make_quota(
                "team-late",
                ROOT_QUOTA_NAME,
                false,
                &[("cpu", "96"), ("memory", "160")],
                &[],
            ))
            .unwrap();

        plugin.migrate_default_quota_group_pods(&CancellationToken::new());

        assert_eq!(default_info.pod_cache_len(), 0);
        assert!(default_info.get_request().is_zero());
        let target_info = manager.get_quota_info("team-late").unwrap();
        assert_eq!(target_info.pod_cache_len(), 4);
        assert_eq!(
            target_info.get_request(),
            ResourceList::new()
                .with(api_types::RESOURCE_CPU, 40_000)
                .with(api_types::RESOURCE_MEMORY, 40)
        );
    }

    #[test]
    fn unresolvable_pods_stay_in_default() {
        let plugin = Plugin::new(ElasticQuotaArgs::default());
        plugin
            .on_pod_add(&make_pod("p1", Some("still-missing"), "1", "1"))
            .unwrap();
        plugin.migrate_default_quota_group_pods(&CancellationToken::new());

        let default_info = plugin
            .registry()
            .default_manager()
            .get_quota_info(api_types::DEFAULT_QUOTA_NAME)
            .unwrap();
        assert_eq!(default_info.pod_cache_len(), 1);
    }

    #[test]
    fn migration_crosses_trees_when_needed() {
        let plugin = Plugin::new(ElasticQuotaArgs::default());
        plugin
            .on_pod_add(&make_pod("p1", Some("tree-quota"), "1", "1"))
            .unwrap();

        let mut quota = make_quota("tree-quota", ROOT_QUOTA_NAME, false, &[("cpu", "96")], &[]);
        quota.metadata.labels.as_mut().unwrap().insert(
            api_types::LABEL_QUOTA_TREE_ID.to_string(),
            "tree-1".to_string(),
        );
        plugin.on_quota_add(&quota).unwrap();

        plugin.migrate_default_quota_group_pods(&CancellationToken::new());

        let tree_manager = plugin.registry().manager_for_tree("tree-1").unwrap();
        assert_eq!(tree_manager.get_quota_info("tree-quota").unwrap().pod_cache_len(), 1);
        assert_eq!(
            plugin
                .registry()
                .default_manager()
                .get_quota_info(api_types::DEFAULT_QUOTA_NAME)
                .unwrap()
                .pod_cache_len(),
            0
        );
    }
}
