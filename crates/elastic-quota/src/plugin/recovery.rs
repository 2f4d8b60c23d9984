//! Cold-start recovery.
//!
//! After a scheduler restart the engine rebuilds its state from the
//! informer-provided object graph in two phases: all quotas first, so the
//! tree exists, then all pods, so the aggregates are correct before the
//! first scheduling cycle. The cluster total comes from summing node
//! allocatables; a root-flagged quota carrying a total-resource annotation
//! overrides it for its tree as it is replayed.

use api_types::{ElasticQuota, ResourceList};
use k8s_openapi::api::core::v1::{Node, Pod};
use tracing::{info, warn};

use super::Plugin;

impl Plugin {
    pub fn recover(&self, nodes: &[Node], quotas: &[ElasticQuota], pods: &[Pod]) {
        let mut total = ResourceList::new();
        for node in nodes {
            if let Some(allocatable) = node
                .status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref())
            {
                total.add_assign(&api_types::resources::parse_k8s_requests(allocatable));
            }
        }
        self.registry()
            .default_manager()
            .update_cluster_total_resource(total);

        for quota in quotas {
            if let Err(e) = self.on_quota_add(quota) {
                warn!(
                    quota = api_types::quota_name(quota),
                    error = %e,
                    "dropping quota during recovery"
                );
            }
        }
        for pod in pods {
            if let Err(e) = self.on_pod_add(pod) {
                warn!(
                    pod = api_types::pod_uid(pod),
                    error = %e,
                    "dropping pod during recovery"
                );
            }
        }
        info!(
            nodes = nodes.len(),
            quotas = quotas.len(),
            pods = pods.len(),
            "recovered quota state from cluster snapshot"
        );
    }
}
