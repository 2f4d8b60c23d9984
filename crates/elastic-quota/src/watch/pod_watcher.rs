//! Watches pods cluster-wide and feeds the plugin's pod event handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::{Api, Client};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin::Plugin;

use super::WATCH_RETRY_SECS;

pub struct PodWatcher {
    client: Client,
}

impl PodWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Watch pods until cancellation, reconnecting when the stream fails.
    pub async fn run(&self, plugin: Arc<Plugin>, cancellation_token: CancellationToken) {
        info!("starting pod watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&plugin) => {
                    match result {
                        Ok(()) => warn!("pod watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(WATCH_RETRY_SECS)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_pods(&self, plugin: &Plugin) -> anyhow::Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        // Previous objects by uid, so update events carry their old state.
        let mut known: HashMap<String, Pod> = HashMap::new();
        let mut stream = watcher(api, Config::default()).boxed();
        while let Some(event) = stream.next().await {
            handle_pod_event(plugin, &mut known, event?);
        }
        Ok(())
    }
}

/// Route one watch event into the plugin. Handler failures are logged and
/// the event dropped; a malformed object must never take the watcher down.
fn handle_pod_event(plugin: &Plugin, known: &mut HashMap<String, Pod>, event: Event<Pod>) {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) => {
            let uid = api_types::pod_uid(&pod).to_string();
            if uid.is_empty() {
                warn!("dropping pod event without uid");
                return;
            }
            let previous = known.insert(uid, pod.clone());
            let result = match previous {
                Some(old_pod) => plugin.on_pod_update(&old_pod, &pod),
                None => plugin.on_pod_add(&pod),
            };
            if let Err(e) = result {
                warn!(pod = api_types::pod_uid(&pod), error = %e, "dropping pod event");
            }
        }
        Event::Delete(pod) => {
            known.remove(api_types::pod_uid(&pod));
            if let Err(e) = plugin.on_pod_delete(&pod) {
                warn!(pod = api_types::pod_uid(&pod), error = %e, "dropping pod delete event");
            }
        }
        Event::Init | Event::InitDone => {}
    }
}
