//! Hierarchical elastic-quota admission and accounting engine.
//!
//! Quota groups form a tree; each group carries a minimum guarantee (Min),
//! an upper cap (Max) and a sharing weight. Pods are charged to leaf groups,
//! aggregates flow up the tree, and each parent's capacity is redistributed
//! to its children by weighted max-min fair share. The scheduler drives the
//! engine through the plugin surface (`PreFilter`, `Reserve`, the event
//! handlers); the informer layer feeds it through the watch adapters.

pub mod config;
pub mod core;
pub mod logging;
pub mod plugin;
pub mod watch;

pub use config::ElasticQuotaArgs;
pub use plugin::framework::{CycleState, Status};
pub use plugin::{Plugin, PLUGIN_NAME};
