//! Quota tree core: per-group state, topology validation, per-tree
//! accounting and the elastic runtime calculator.

pub mod error;
pub mod group_quota_manager;
pub mod quota_info;
pub mod quota_topology;
pub mod registry;
pub mod runtime_calculator;

pub use error::{QuotaError, Result};
pub use group_quota_manager::GroupQuotaManager;
pub use quota_info::{PodInfo, QuotaInfo, QuotaMeta};
pub use quota_topology::{PodProbe, QuotaTopology};
pub use registry::{QuotaManagerRegistry, DEFAULT_TREE_ID};
