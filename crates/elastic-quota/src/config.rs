//! Plugin configuration.

use std::time::Duration;

use api_types::ResourceList;
use clap::Parser;

/// Arguments of the elastic-quota plugin.
#[derive(Parser, Clone, Debug)]
#[command(name = "elastic-quota")]
pub struct ElasticQuotaArgs {
    #[arg(
        long,
        env = "EQ_QUOTA_GROUP_NAMESPACE",
        default_value = "elastic-quota-system",
        help = "Namespace holding the auto-created default and system quota groups"
    )]
    pub quota_group_namespace: String,

    #[arg(
        long,
        env = "EQ_SYSTEM_QUOTA_GROUP_MAX",
        default_value = r#"{"cpu":"100","memory":"400Gi"}"#,
        value_parser = parse_resource_map_arg,
        help = "Max vector of the reserved system quota group, as a JSON resource map"
    )]
    pub system_quota_group_max: ResourceList,

    #[arg(
        long,
        env = "EQ_DEFAULT_QUOTA_GROUP_MAX",
        default_value = r#"{"cpu":"40000","memory":"400Ti"}"#,
        value_parser = parse_resource_map_arg,
        help = "Max vector of the reserved default quota group, as a JSON resource map"
    )]
    pub default_quota_group_max: ResourceList,

    #[arg(
        long,
        env = "EQ_ENABLE_RUNTIME_QUOTA",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Enable elastic runtime redistribution; when false a group's runtime equals its max"
    )]
    pub enable_runtime_quota: bool,

    #[arg(
        long,
        env = "EQ_ENABLE_CHECK_PARENT_QUOTA",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Enforce admission against every ancestor of the target quota group"
    )]
    pub enable_check_parent_quota: bool,

    #[arg(
        long,
        env = "EQ_ENABLE_MIN_QUOTA_SUM_CHECK",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Reject structural changes that push a parent's children Min sum above its own Min"
    )]
    pub enable_min_quota_sum_check: bool,

    #[arg(
        long,
        env = "EQ_DELAY_EVICT_SECONDS",
        default_value = "300",
        help = "Startup grace period in seconds before the background reconciler begins"
    )]
    pub delay_evict_seconds: u64,

    #[arg(
        long,
        env = "EQ_REVOKE_POD_INTERVAL_SECONDS",
        default_value = "60",
        help = "Interval in seconds between background reconciler passes"
    )]
    pub revoke_pod_interval_seconds: u64,
}

impl ElasticQuotaArgs {
    pub fn delay_evict_time(&self) -> Duration {
        Duration::from_secs(self.delay_evict_seconds)
    }

    pub fn revoke_pod_interval(&self) -> Duration {
        Duration::from_secs(self.revoke_pod_interval_seconds)
    }
}

impl Default for ElasticQuotaArgs {
    fn default() -> Self {
        Self::parse_from(["elastic-quota"])
    }
}

fn parse_resource_map_arg(raw: &str) -> Result<ResourceList, String> {
    let map: std::collections::BTreeMap<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| format!("not a JSON resource map: {e}"))?;
    let quantities = map
        .into_iter()
        .map(|(resource, value)| {
            let quantity = match value {
                serde_json::Value::String(s) => Ok(s),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                other => Err(format!("unsupported value {other} for resource {resource}")),
            }?;
            Ok((resource, quantity))
        })
        .collect::<Result<std::collections::BTreeMap<String, String>, String>>()?;
    api_types::resources::parse_quantity_map(&quantities).map_err(|e| e.to_string())
}
