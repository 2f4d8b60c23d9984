//! Watches ElasticQuota objects and feeds the plugin's quota handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::ElasticQuota;
use futures::StreamExt;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::{Api, Client};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin::Plugin;

use super::WATCH_RETRY_SECS;

pub struct QuotaWatcher {
    client: Client,
}

impl QuotaWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Watch quota objects until cancellation, reconnecting when the
    /// stream fails.
    pub async fn run(&self, plugin: Arc<Plugin>, cancellation_token: CancellationToken) {
        info!("starting quota watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("quota watcher shutdown requested");
                    break;
                }
                result = self.watch_quotas(&plugin) => {
                    match result {
                        Ok(()) => warn!("quota watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("quota watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(WATCH_RETRY_SECS)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_quotas(&self, plugin: &Plugin) -> anyhow::Result<()> {
        let api: Api<ElasticQuota> = Api::all(self.client.clone());
        let mut known: HashMap<String, ElasticQuota> = HashMap::new();
        let mut stream = watcher(api, Config::default()).boxed();
        while let Some(event) = stream.next().await {
            handle_quota_event(plugin, &mut known, event?);
        }
        Ok(())
    }
}

/// Route one watch event into the plugin, logging and dropping failures.
fn handle_quota_event(
    plugin: &Plugin,
    known: &mut HashMap<String, ElasticQuota>,
    event: Event<ElasticQuota>,
) {
    match event {
        Event::Apply(quota) | Event::InitApply(quota) => {
            let name = api_types::quota_name(&quota).to_string();
            if name.is_empty() {
                warn!("dropping quota event without name");
                return;
            }
            let previous = known.insert(name.clone(), quota.clone());
            let result = match previous {
                Some(old_quota) => plugin.on_quota_update(Some(&old_quota), &quota),
                None => plugin.on_quota_add(&quota),
            };
            if let Err(e) = result {
                warn!(quota = %name, error = %e, "dropping quota event");
            }
        }
        Event::Delete(quota) => {
            known.remove(api_types::quota_name(&quota));
            if let Err(e) = plugin.on_quota_delete(&quota) {
                warn!(
                    quota = api_types::quota_name(&quota),
                    error = %e,
                    "dropping quota delete event"
                );
            }
        }
        Event::Init | Event::InitDone => {}
    }
}
