//! Plugin core: event handlers, pod-to-quota resolution and admission.
//!
//! Informer events and scheduler hooks land here and are routed through the
//! topology (structural validation) into the per-tree managers. Admission is
//! fully synchronous: PreFilter checks the target group's runtime and, for
//! non-preemptible pods, its Min, then snapshots the group's usage into the
//! cycle state for the preemption hooks. A denied admission never mutates
//! tree state and is never reported as an error.

pub mod framework;
pub mod migrator;
pub mod recovery;
pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::{
    ElasticQuota, ElasticQuotaSpec, ResourceList, DEFAULT_QUOTA_NAME, LABEL_QUOTA_PARENT,
    ROOT_QUOTA_NAME, SYSTEM_QUOTA_NAME,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, error, info, warn};

use crate::config::ElasticQuotaArgs;
use crate::core::error::Result;
use crate::core::group_quota_manager::GroupQuotaManager;
use crate::core::quota_topology::PodProbe;
use crate::core::{QuotaManagerRegistry, QuotaTopology};

use framework::{CycleState, Status};
use state::{get_post_filter_state, skip_post_filter_state, snapshot_post_filter_state};

pub const PLUGIN_NAME: &str = "ElasticQuota";

pub struct Plugin {
    args: ElasticQuotaArgs,
    topology: QuotaTopology,
    registry: QuotaManagerRegistry,
}

/// Pod probe backed by the managers' pod caches.
struct RegistryPodProbe<'a> {
    registry: &'a QuotaManagerRegistry,
}

impl PodProbe for RegistryPodProbe<'_> {
    fn quota_has_pods(&self, quota_name: &str) -> bool {
        self.registry
            .manager_for_quota(quota_name)
            .map(|manager| manager.quota_has_pods(quota_name))
            .unwrap_or(false)
    }
}

impl Plugin {
    pub fn new(args: ElasticQuotaArgs) -> Self {
        let plugin = Self {
            topology: QuotaTopology::new(args.enable_min_quota_sum_check),
            registry: QuotaManagerRegistry::new(args.enable_runtime_quota),
            args,
        };
        plugin.ensure_reserved_quota_groups();
        plugin
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn args(&self) -> &ElasticQuotaArgs {
        &self.args
    }

    pub fn registry(&self) -> &QuotaManagerRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &QuotaTopology {
        &self.topology
    }

    /// Create the reserved `default` and `system` groups, with Max vectors
    /// from configuration, if they are not present yet.
    fn ensure_reserved_quota_groups(&self) {
        for (name, max) in [
            (DEFAULT_QUOTA_NAME, self.args.default_quota_group_max.clone()),
            (SYSTEM_QUOTA_NAME, self.args.system_quota_group_max.clone()),
        ] {
            if self.registry.has_quota(name) {
                continue;
            }
            let quota = self.reserved_quota_object(name, &max);
            if let Err(e) = self.on_quota_add(&quota) {
                error!(quota = name, error = %e, "failed to create reserved quota group");
            }
        }
    }

    fn reserved_quota_object(&self, name: &str, max: &ResourceList) -> ElasticQuota {
        ElasticQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.args.quota_group_namespace.clone()),
                labels: Some(
                    [(LABEL_QUOTA_PARENT.to_string(), ROOT_QUOTA_NAME.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ElasticQuotaSpec {
                max: max.to_quantity_map(),
                min: BTreeMap::new(),
            },
        }
    }

    fn manager_for(&self, quota_name: &str) -> Arc<GroupQuotaManager> {
        self.registry
            .manager_for_quota(quota_name)
            .unwrap_or_else(|| self.registry.default_manager())
    }

    /// Resolve the quota group a pod is charged to: explicit label first,
    /// then the namespace binding, then the system group for
    /// system-critical pods, and `default` as the fall-back. A label naming
    /// a group that does not exist (yet) also lands in `default`; the
    /// background migrator moves the pod once the group appears.
    pub fn get_pod_associate_quota_name(&self, pod: &Pod) -> String {
        if let Some(label) = api_types::pod_quota_name(pod) {
            if self.registry.has_quota(label) {
                return label.to_string();
            }
            return DEFAULT_QUOTA_NAME.to_string();
        }
        if let Some(namespace) = pod.metadata.namespace.as_deref() {
            if let Some(quota) = self.topology.quota_for_namespace(namespace) {
                if self.registry.has_quota(&quota) {
                    return quota;
                }
            }
        }
        if api_types::pod_is_system_critical(pod) {
            return SYSTEM_QUOTA_NAME.to_string();
        }
        DEFAULT_QUOTA_NAME.to_string()
    }

    pub fn on_quota_add(&self, quota: &ElasticQuota) -> Result<()> {
        if quota.metadata.deletion_timestamp.is_some() {
            debug!(quota = api_types::quota_name(quota), "ignoring add of quota pending deletion");
            return Ok(());
        }
        let mut quota = quota.clone();
        self.topology.fill_defaults(&mut quota)?;

        let probe = RegistryPodProbe { registry: &self.registry };
        let outcome = self.topology.valid_add_quota(&quota, &probe)?;
        let manager = self.registry.get_or_create_manager(&outcome.meta.tree_id);
        if outcome.parent_flipped {
            manager.set_quota_is_parent(&outcome.meta.parent_name, true);
        }
        let name = outcome.meta.name.clone();
        let tree_id = outcome.meta.tree_id.clone();
        if let Err(e) = manager.add_quota(outcome.meta) {
            error!(quota = %name, error = %e, "BUG: manager rejected a topology-validated add");
            return Err(e);
        }
        self.registry.register_quota(&name, &tree_id);

        if api_types::quota_is_root(&quota) {
            if let Some(total) = api_types::quota_total_resource(&quota)? {
                manager.update_cluster_total_resource(total);
            }
        }
        info!(quota = %name, tree = %tree_id, "quota group added");
        Ok(())
    }

    pub fn on_quota_update(
        &self,
        old_quota: Option<&ElasticQuota>,
        new_quota: &ElasticQuota,
    ) -> Result<()> {
        if let Some(old_quota) = old_quota {
            let old_version = old_quota.metadata.resource_version.as_deref();
            let new_version = new_quota.metadata.resource_version.as_deref();
            if old_version.is_some() && old_version == new_version {
                return Ok(());
            }
        }
        if new_quota.metadata.deletion_timestamp.is_some() {
            return self.on_quota_delete(new_quota);
        }
        // Compare governed fields on the raw objects, before defaults are
        // filled in, so replayed no-op updates return early.
        if let Some(old_quota) = old_quota {
            if crate::core::quota_topology::quota_fields_equal(old_quota, new_quota) {
                return Ok(());
            }
        }

        let mut filled = new_quota.clone();
        self.topology.fill_defaults(&mut filled)?;
        let probe = RegistryPodProbe { registry: &self.registry };
        let Some(outcome) = self
            .topology
            .valid_update_quota(old_quota, &filled, &probe)?
        else {
            return Ok(());
        };

        let manager = self.registry.get_or_create_manager(&outcome.meta.tree_id);
        if outcome.parent_flipped {
            manager.set_quota_is_parent(&outcome.meta.parent_name, true);
        }
        let name = outcome.meta.name.clone();
        if outcome.old_parent != outcome.meta.parent_name {
            info!(
                quota = %name,
                old_parent = %outcome.old_parent,
                new_parent = %outcome.meta.parent_name,
                "quota group reparented"
            );
        }
        manager.update_quota(outcome.meta)?;

        if api_types::quota_is_root(&filled) {
            if let Some(total) = api_types::quota_total_resource(&filled)? {
                manager.update_cluster_total_resource(total);
            }
        }
        Ok(())
    }

    pub fn on_quota_delete(&self, quota: &ElasticQuota) -> Result<()> {
        let name = api_types::quota_name(quota);
        let probe = RegistryPodProbe { registry: &self.registry };
        self.topology.valid_delete_quota(name, &probe)?;
        if let Some(manager) = self.registry.manager_for_quota(name) {
            manager.delete_quota(name)?;
        }
        self.registry.unregister_quota(name);
        info!(quota = name, "quota group deleted");
        Ok(())
    }

    pub fn on_pod_add(&self, pod: &Pod) -> Result<()> {
        let quota_name = self.get_pod_associate_quota_name(pod);
        let manager = self.manager_for(&quota_name);
        manager.on_pod_add(&quota_name, Arc::new(pod.clone()))
    }

    pub fn on_pod_update(&self, old_pod: &Pod, new_pod: &Pod) -> Result<()> {
        let old_version = old_pod.metadata.resource_version.as_deref();
        let new_version = new_pod.metadata.resource_version.as_deref();
        if old_version.is_some() && old_version == new_version {
            return Ok(());
        }

        let old_quota = self.get_pod_associate_quota_name(old_pod);
        let new_quota = self.get_pod_associate_quota_name(new_pod);
        if old_quota == new_quota {
            let manager = self.manager_for(&new_quota);
            return manager.on_pod_update(&new_quota, Arc::new(new_pod.clone()));
        }

        self.manager_for(&old_quota).on_pod_delete(&old_quota, old_pod)?;
        self.manager_for(&new_quota)
            .on_pod_add(&new_quota, Arc::new(new_pod.clone()))
    }

    pub fn on_pod_delete(&self, pod: &Pod) -> Result<()> {
        let quota_name = self.get_pod_associate_quota_name(pod);
        let removed = self.manager_for(&quota_name).on_pod_delete(&quota_name, pod)?;
        if !removed && quota_name != DEFAULT_QUOTA_NAME {
            // The pod may still sit in `default` from before its group
            // existed; the migrator has not caught up yet.
            self.registry
                .default_manager()
                .on_pod_delete(DEFAULT_QUOTA_NAME, pod)?;
        }
        Ok(())
    }

    /// Admission entry point. Returns `Success` or `Unschedulable`; a quota
    /// violation is never an `Error`.
    pub fn pre_filter(&self, state: &mut CycleState, pod: &Pod) -> Status {
        let pod_request = api_types::pod_requests(pod);
        let quota_name = self.get_pod_associate_quota_name(pod);
        let Some(manager) = self.registry.manager_for_quota(&quota_name) else {
            skip_post_filter_state(state);
            return Status::Success;
        };
        let Some(quota_info) = manager.get_quota_info(&quota_name) else {
            skip_post_filter_state(state);
            return Status::Success;
        };

        let runtime = self.runtime_of(&manager, &quota_name, &quota_info);
        let used = quota_info.get_used();
        let non_preemptible_used = quota_info.get_non_preemptible_used();

        if self.args.enable_check_parent_quota {
            let status = self.check_quota_recursive(
                &manager,
                &quota_name,
                &[quota_name.clone()],
                &pod_request,
            );
            if !status.is_success() {
                return status;
            }
        } else {
            // Dimensions the group's runtime does not track are ungoverned
            // and do not gate admission.
            let masked_request = pod_request.mask(&runtime);
            let (fits, exceeded) = used.add(&masked_request).less_equal_governed(&runtime);
            if !fits {
                return Status::Unschedulable(format!(
                    "Insufficient quotas, quotaName: {quota_name}, runtime: {runtime}, \
                     used: {used}, pod's request: {masked_request}, \
                     exceedDimensions: {}",
                    format_dimensions(&exceeded)
                ));
            }
        }

        if api_types::pod_is_non_preemptible(pod) {
            // Unlike the runtime gate, the Min gate is strict: a dimension
            // the group's Min does not list guarantees nothing.
            let min = quota_info.get_min();
            let (fits, exceeded) = non_preemptible_used
                .add(&pod_request)
                .less_equal_strict(&min);
            if !fits {
                return Status::Unschedulable(format!(
                    "Insufficient non-preemptible quotas, quotaName: {quota_name}, min: {min}, \
                     nonPreemptibleUsed: {non_preemptible_used}, pod's request: {pod_request}, \
                     exceedDimensions: {}",
                    format_dimensions(&exceeded)
                ));
            }
        }

        snapshot_post_filter_state(&quota_name, runtime, used, non_preemptible_used, state);
        Status::Success
    }

    fn runtime_of(
        &self,
        manager: &GroupQuotaManager,
        quota_name: &str,
        quota_info: &crate::core::QuotaInfo,
    ) -> ResourceList {
        if self.args.enable_runtime_quota {
            manager.refresh_runtime(quota_name).unwrap_or_default()
        } else {
            quota_info.get_max()
        }
    }

    /// Walk the target group and its ancestors, applying the runtime check
    /// at every level. The failure message lists the chain from the
    /// outermost checked ancestor down to the target group.
    fn check_quota_recursive(
        &self,
        manager: &GroupQuotaManager,
        quota_name: &str,
        quota_name_topo: &[String],
        pod_request: &ResourceList,
    ) -> Status {
        let Some(quota_info) = manager.get_quota_info(quota_name) else {
            return Status::Success;
        };
        let runtime = self.runtime_of(manager, quota_name, &quota_info);
        let used = quota_info.get_used();
        let (fits, exceeded) = used.add(pod_request).less_equal_governed(&runtime);
        if !fits {
            return Status::Unschedulable(format!(
                "Insufficient quotas, quotaNameTopo: {}, runtime: {runtime}, used: {used}, \
                 pod's request: {pod_request}, exceedDimensions: {}",
                format_names(quota_name_topo),
                format_dimensions(&exceeded)
            ));
        }
        let parent = quota_info.parent_name();
        if parent.is_empty() || parent == ROOT_QUOTA_NAME {
            return Status::Success;
        }
        let mut topo = Vec::with_capacity(quota_name_topo.len() + 1);
        topo.push(parent.clone());
        topo.extend_from_slice(quota_name_topo);
        self.check_quota_recursive(manager, &parent, &topo, pod_request)
    }

    /// Mark the pod assigned in its group; Used counts it from now on.
    pub fn reserve(&self, _state: &mut CycleState, pod: &Pod, _node_name: &str) -> Status {
        let quota_name = self.get_pod_associate_quota_name(pod);
        if let Err(e) = self.manager_for(&quota_name).reserve_pod(&quota_name, pod) {
            warn!(
                pod = api_types::pod_uid(pod),
                quota = %quota_name,
                error = %e,
                "reserve could not mark pod assigned"
            );
        }
        Status::Success
    }

    /// Exact reverse of [`Self::reserve`].
    pub fn unreserve(&self, _state: &mut CycleState, pod: &Pod, _node_name: &str) {
        let quota_name = self.get_pod_associate_quota_name(pod);
        if let Err(e) = self.manager_for(&quota_name).unreserve_pod(&quota_name, pod) {
            warn!(
                pod = api_types::pod_uid(pod),
                quota = %quota_name,
                error = %e,
                "unreserve could not clear pod assignment"
            );
        }
    }

    /// Hypothetically place a pod into the cycle-local snapshot. Tree state
    /// is never touched.
    pub fn add_pod(&self, state: &mut CycleState, pod: &Pod) -> Status {
        let post = match get_post_filter_state(state) {
            Ok(post) => post,
            Err(message) => return Status::Error(message),
        };
        if post.skip {
            return Status::Success;
        }
        post.used.add_assign(&api_types::pod_requests(pod));
        Status::Success
    }

    /// Hypothetically evict a pod from the cycle-local snapshot.
    pub fn remove_pod(&self, state: &mut CycleState, pod: &Pod) -> Status {
        let post = match get_post_filter_state(state) {
            Ok(post) => post,
            Err(message) => return Status::Error(message),
        };
        if post.skip {
            return Status::Success;
        }
        post.used = post.used.sub_clamp_zero(&api_types::pod_requests(pod));
        Status::Success
    }

    /// Snapshot a group's usage into the cycle state, as PreFilter does.
    pub fn snapshot_post_filter_state(
        &self,
        quota_info: &crate::core::QuotaInfo,
        state: &mut CycleState,
    ) {
        let manager = self.manager_for(quota_info.name());
        let runtime = self.runtime_of(&manager, quota_info.name(), quota_info);
        snapshot_post_filter_state(
            quota_info.name(),
            runtime,
            quota_info.get_used(),
            quota_info.get_non_preemptible_used(),
            state,
        );
    }
}

// Slices render space-separated inside brackets, the way the original
// scheduler prints them; the message text is part of the contract.
fn format_dimensions(dimensions: &[String]) -> String {
    format!("[{}]", dimensions.join(" "))
}

fn format_names(names: &[String]) -> String {
    format!("[{}]", names.join(" "))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    pub fn make_quota(
        name: &str,
        parent: &str,
        is_parent: bool,
        max: &[(&str, &str)],
        min: &[(&str, &str)],
    ) -> ElasticQuota {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_QUOTA_PARENT.to_string(), parent.to_string());
        labels.insert(
            api_types::LABEL_QUOTA_IS_PARENT.to_string(),
            if is_parent { "true" } else { "false" }.to_string(),
        );
        ElasticQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                annotations: Some(BTreeMap::new()),
                ..Default::default()
            },
            spec: ElasticQuotaSpec {
                max: max.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                min: min.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            },
        }
    }

    pub fn make_pod(uid: &str, quota: Option<&str>, cpu: &str, memory: &str) -> Pod {
        let mut labels = BTreeMap::new();
        if let Some(quota) = quota {
            labels.insert(api_types::LABEL_QUOTA_NAME.to_string(), quota.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{uid}")),
                namespace: Some("default-ns".to_string()),
                uid: Some(uid.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            [
                                ("cpu".to_string(), Quantity(cpu.to_string())),
                                ("memory".to_string(), Quantity(memory.to_string())),
                            ]
                            .into_iter()
                            .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn assign(mut pod: Pod) -> Pod {
        pod.spec.as_mut().unwrap().node_name = Some("test-node".to_string());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    pub fn mark_non_preemptible(mut pod: Pod) -> Pod {
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(api_types::LABEL_PREEMPTIBLE.to_string(), "false".to_string());
        pod
    }
}
