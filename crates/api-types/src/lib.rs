//! Shared API type definitions
//!
//! This crate contains the external-interface types used across the
//! elastic-quota project: the persisted `ElasticQuota` object, the label and
//! annotation keys consumed from quota and pod objects, typed accessors for
//! both, and the [`ResourceList`] vector type used for all quota arithmetic.

use std::collections::BTreeMap;

use error_stack::{Report, ResultExt};
use k8s_openapi::api::core::v1::Pod;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod resources;

pub use resources::{ResourceList, RESOURCE_CPU, RESOURCE_MEMORY};

/// Domain prefix for quota labels and annotations.
pub const QUOTA_DOMAIN: &str = "quota.scheduling.dev";

/// Quota label: name of the parent quota group.
pub const LABEL_QUOTA_PARENT: &str = "quota.scheduling.dev/parent";
/// Quota label: id of the tree this group belongs to.
pub const LABEL_QUOTA_TREE_ID: &str = "quota.scheduling.dev/tree-id";
/// Quota label: `"true"` iff the group may have children.
pub const LABEL_QUOTA_IS_PARENT: &str = "quota.scheduling.dev/is-parent";
/// Quota label: `"true"` iff the group is the root of its tree and carries
/// the tree's total resource in an annotation.
pub const LABEL_QUOTA_IS_ROOT: &str = "quota.scheduling.dev/is-root";
/// Quota label: `"false"` keeps the group's idle Min from being lent to
/// siblings.
pub const LABEL_ALLOW_LENT_RESOURCE: &str = "quota.scheduling.dev/allow-lent-resource";

/// Pod label: explicit target quota group.
pub const LABEL_QUOTA_NAME: &str = "quota.scheduling.dev/name";
/// Pod label: `"false"` marks the pod non-preemptible.
pub const LABEL_PREEMPTIBLE: &str = "quota.scheduling.dev/preemptible";

/// Quota annotation: JSON resource map overriding the sharing weight.
pub const ANNOTATION_SHARED_WEIGHT: &str = "quota.scheduling.dev/shared-weight";
/// Quota annotation: JSON resource map with the tree's total resource
/// (root-flagged quotas only).
pub const ANNOTATION_TOTAL_RESOURCE: &str = "quota.scheduling.dev/total-resource";
/// Quota annotation: JSON list of namespaces bound to this group.
pub const ANNOTATION_QUOTA_NAMESPACES: &str = "quota.scheduling.dev/namespaces";

/// Reserved group: abstract aggregate parent of all top-level groups.
pub const ROOT_QUOTA_NAME: &str = "root";
/// Reserved group: fall-back for pods whose resolved group does not exist.
pub const DEFAULT_QUOTA_NAME: &str = "default";
/// Reserved group: pods outside user quotas (system daemons).
pub const SYSTEM_QUOTA_NAME: &str = "system";

/// Priority class names that route a pod into the `system` group.
pub const SYSTEM_PRIORITY_CLASSES: [&str; 2] =
    ["system-cluster-critical", "system-node-critical"];

/// Errors raised while reading quota or pod objects.
#[derive(Debug, thiserror::Error)]
pub enum ObjectParseError {
    #[error("invalid quantity {value:?} for resource {resource}")]
    InvalidQuantity { resource: String, value: String },

    #[error("invalid {annotation} annotation: {message}")]
    AnnotationParse { annotation: String, message: String },
}

/// Spec of the persisted ElasticQuota object. Resource maps hold Kubernetes
/// quantity strings ("96", "100m", "160Gi").
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "quota.scheduling.dev",
    version = "v1alpha1",
    kind = "ElasticQuota",
    plural = "elasticquotas",
    shortname = "eq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticQuotaSpec {
    /// Upper cap of the group's share.
    #[serde(default)]
    pub max: BTreeMap<String, String>,
    /// Minimum guarantee of the group's share.
    #[serde(default)]
    pub min: BTreeMap<String, String>,
}

fn quota_label<'a>(quota: &'a ElasticQuota, key: &str) -> Option<&'a str> {
    quota
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn quota_annotation<'a>(quota: &'a ElasticQuota, key: &str) -> Option<&'a str> {
    quota
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Name of the quota group. Empty when the object carries no name.
pub fn quota_name(quota: &ElasticQuota) -> &str {
    quota.metadata.name.as_deref().unwrap_or("")
}

/// Parent group name from the parent label; empty when unset.
pub fn quota_parent_name(quota: &ElasticQuota) -> &str {
    quota_label(quota, LABEL_QUOTA_PARENT).unwrap_or("")
}

/// Tree id from the tree-id label; empty for the default tree.
pub fn quota_tree_id(quota: &ElasticQuota) -> &str {
    quota_label(quota, LABEL_QUOTA_TREE_ID).unwrap_or("")
}

/// Whether the group may have children.
pub fn quota_is_parent(quota: &ElasticQuota) -> bool {
    quota_label(quota, LABEL_QUOTA_IS_PARENT) == Some("true")
}

/// Whether the group is a tree root carrying the total-resource annotation.
pub fn quota_is_root(quota: &ElasticQuota) -> bool {
    quota_label(quota, LABEL_QUOTA_IS_ROOT) == Some("true")
}

/// Whether the group lends its idle Min to siblings (default true).
pub fn quota_allow_lent_resource(quota: &ElasticQuota) -> bool {
    quota_label(quota, LABEL_ALLOW_LENT_RESOURCE) != Some("false")
}

/// Namespaces bound to this group via the namespaces annotation.
pub fn quota_namespaces(quota: &ElasticQuota) -> Vec<String> {
    let Some(raw) = quota_annotation(quota, ANNOTATION_QUOTA_NAMESPACES) else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_default()
}

/// Parsed Max vector from the spec.
pub fn quota_max(quota: &ElasticQuota) -> Result<ResourceList, Report<ObjectParseError>> {
    resources::parse_quantity_map(&quota.spec.max)
}

/// Parsed Min vector from the spec.
pub fn quota_min(quota: &ElasticQuota) -> Result<ResourceList, Report<ObjectParseError>> {
    resources::parse_quantity_map(&quota.spec.min)
}

fn parse_annotation_resource_map(
    quota: &ElasticQuota,
    annotation: &'static str,
) -> Result<Option<ResourceList>, Report<ObjectParseError>> {
    let Some(raw) = quota_annotation(quota, annotation) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let map: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw).change_context(
        ObjectParseError::AnnotationParse {
            annotation: annotation.to_string(),
            message: format!("not a JSON resource map: {raw}"),
        },
    )?;
    let mut quantities = BTreeMap::new();
    for (resource, value) in map {
        let quantity = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(Report::new(ObjectParseError::AnnotationParse {
                    annotation: annotation.to_string(),
                    message: format!("unsupported value {other} for resource {resource}"),
                }))
            }
        };
        quantities.insert(resource, quantity);
    }
    resources::parse_quantity_map(&quantities).map(Some)
}

/// Sharing weight from the shared-weight annotation, when present.
pub fn quota_shared_weight(
    quota: &ElasticQuota,
) -> Result<Option<ResourceList>, Report<ObjectParseError>> {
    parse_annotation_resource_map(quota, ANNOTATION_SHARED_WEIGHT)
}

/// Tree total resource from the total-resource annotation, when present.
pub fn quota_total_resource(
    quota: &ElasticQuota,
) -> Result<Option<ResourceList>, Report<ObjectParseError>> {
    parse_annotation_resource_map(quota, ANNOTATION_TOTAL_RESOURCE)
}

/// Pod uid as a string; empty when the object carries none.
pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or("")
}

/// Explicit target quota group from the pod's quota-name label.
pub fn pod_quota_name(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_QUOTA_NAME))
        .map(String::as_str)
}

/// Whether the pod carries the non-preemptible marker.
pub fn pod_is_non_preemptible(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_PREEMPTIBLE))
        .map(String::as_str)
        == Some("false")
}

/// Whether the pod should be routed to the `system` group.
pub fn pod_is_system_critical(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.priority_class_name.as_deref())
        .is_some_and(|class| SYSTEM_PRIORITY_CLASSES.contains(&class))
}

/// Whether the pod occupies its quota share: bound to a node or Running.
pub fn pod_is_assigned(pod: &Pod) -> bool {
    let bound = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty());
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    bound || running
}

/// Total resource request of a pod in engine units (cpu milli, memory bytes).
///
/// Regular containers' requests are summed; each init container contributes
/// its per-dimension maximum against the running sum, since init containers
/// execute sequentially before the main containers start.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let Some(spec) = pod.spec.as_ref() else {
        return ResourceList::default();
    };

    let mut total = ResourceList::default();
    for container in &spec.containers {
        if let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref())
        {
            total = total.add(&resources::parse_k8s_requests(requests));
        }
    }

    if let Some(init_containers) = spec.init_containers.as_ref() {
        for container in init_containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref())
            {
                total = total.max(&resources::parse_k8s_requests(requests));
            }
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn quota_with_labels(name: &str, labels: &[(&str, &str)]) -> ElasticQuota {
        ElasticQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ElasticQuotaSpec::default(),
        }
    }

    fn container_with_requests(cpu: &str, memory: &str) -> Container {
        Container {
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
        }
    }

    #[test]
    fn quota_label_accessors() {
        let quota = quota_with_labels(
            "team-a",
            &[
                (LABEL_QUOTA_PARENT, "org"),
                (LABEL_QUOTA_TREE_ID, "tree-1"),
                (LABEL_QUOTA_IS_PARENT, "true"),
            ],
        );
        assert_eq!(quota_name(&quota), "team-a");
        assert_eq!(quota_parent_name(&quota), "org");
        assert_eq!(quota_tree_id(&quota), "tree-1");
        assert!(quota_is_parent(&quota));
        assert!(!quota_is_root(&quota));
    }

    #[test]
    fn shared_weight_annotation_accepts_numbers_and_strings() {
        let mut quota = quota_with_labels("team-a", &[]);
        quota.metadata.annotations = Some(
            [(
                ANNOTATION_SHARED_WEIGHT.to_string(),
                r#"{"cpu":96, "memory":"160Gi"}"#.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        let weight = quota_shared_weight(&quota).unwrap().unwrap();
        assert_eq!(weight.get(RESOURCE_CPU), 96_000);
        assert_eq!(weight.get(RESOURCE_MEMORY), 160 * (1 << 30));
    }

    #[test]
    fn shared_weight_annotation_rejects_garbage() {
        let mut quota = quota_with_labels("team-a", &[]);
        quota.metadata.annotations = Some(
            [(ANNOTATION_SHARED_WEIGHT.to_string(), "not json".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(quota_shared_weight(&quota).is_err());
    }

    #[test]
    fn quota_namespaces_parses_json_list() {
        let mut quota = quota_with_labels("team-a", &[]);
        quota.metadata.annotations = Some(
            [(
                ANNOTATION_QUOTA_NAMESPACES.to_string(),
                r#"["ns-1","ns-2"]"#.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(quota_namespaces(&quota), vec!["ns-1", "ns-2"]);
    }

    #[test]
    fn pod_requests_sums_containers() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![
                    container_with_requests("500m", "1Gi"),
                    container_with_requests("1", "1Gi"),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let requests = pod_requests(&pod);
        assert_eq!(requests.get(RESOURCE_CPU), 1_500);
        assert_eq!(requests.get(RESOURCE_MEMORY), 2 * (1 << 30));
    }

    #[test]
    fn pod_requests_takes_init_container_max() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container_with_requests("500m", "1Gi")],
                init_containers: Some(vec![container_with_requests("2", "512Mi")]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let requests = pod_requests(&pod);
        // init container dominates cpu, main container dominates memory
        assert_eq!(requests.get(RESOURCE_CPU), 2_000);
        assert_eq!(requests.get(RESOURCE_MEMORY), 1 << 30);
    }

    #[test]
    fn pod_assignment_and_markers() {
        let mut pod = Pod {
            metadata: ObjectMeta {
                labels: Some(
                    [(LABEL_PREEMPTIBLE.to_string(), "false".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        assert!(pod_is_non_preemptible(&pod));
        assert!(!pod_is_assigned(&pod));

        pod.spec.as_mut().unwrap().node_name = Some("node-1".to_string());
        assert!(pod_is_assigned(&pod));

        pod.spec.as_mut().unwrap().node_name = None;
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(pod_is_assigned(&pod));
    }
}
