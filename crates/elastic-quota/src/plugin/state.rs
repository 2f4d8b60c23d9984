//! Cycle-local snapshot of the target group's usage.
//!
//! PreFilter copies the chosen group's Runtime/Used/NonPreemptibleUsed here;
//! AddPod and RemovePod mutate this candidate view during preemption victim
//! evaluation without ever taking tree locks or touching tree state.

use std::any::Any;

use api_types::ResourceList;

use super::framework::{CycleState, StateData};

const POST_FILTER_STATE_KEY: &str = "PostFilterElasticQuota";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostFilterState {
    pub quota_name: String,
    /// Set when PreFilter had nothing to snapshot (unknown quota or runtime
    /// checks disabled); AddPod/RemovePod become no-ops.
    pub skip: bool,
    pub runtime: ResourceList,
    pub used: ResourceList,
    pub non_preemptible_used: ResourceList,
}

impl StateData for PostFilterState {
    fn clone_box(&self) -> Box<dyn StateData> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn snapshot_post_filter_state(
    quota_name: &str,
    runtime: ResourceList,
    used: ResourceList,
    non_preemptible_used: ResourceList,
    state: &mut CycleState,
) {
    state.write(
        POST_FILTER_STATE_KEY,
        Box::new(PostFilterState {
            quota_name: quota_name.to_string(),
            skip: false,
            runtime,
            used,
            non_preemptible_used,
        }),
    );
}

pub fn skip_post_filter_state(state: &mut CycleState) {
    state.write(
        POST_FILTER_STATE_KEY,
        Box::new(PostFilterState {
            skip: true,
            ..Default::default()
        }),
    );
}

pub fn get_post_filter_state(state: &mut CycleState) -> Result<&mut PostFilterState, String> {
    state
        .read_mut::<PostFilterState>(POST_FILTER_STATE_KEY)
        .ok_or_else(|| format!("{POST_FILTER_STATE_KEY} not found in cycle state"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_types::RESOURCE_CPU;

    #[test]
    fn snapshot_survives_cycle_state_clone() {
        let mut state = CycleState::new();
        snapshot_post_filter_state(
            "team-a",
            ResourceList::new().with(RESOURCE_CPU, 10_000),
            ResourceList::new().with(RESOURCE_CPU, 4_000),
            ResourceList::new(),
            &mut state,
        );

        let mut copy = state.clone();
        get_post_filter_state(&mut copy)
            .unwrap()
            .used
            .add_assign(&ResourceList::new().with(RESOURCE_CPU, 1_000));

        assert_eq!(
            get_post_filter_state(&mut state).unwrap().used.get(RESOURCE_CPU),
            4_000
        );
        assert_eq!(
            get_post_filter_state(&mut copy).unwrap().used.get(RESOURCE_CPU),
            5_000
        );
    }

    #[test]
    fn skip_state_is_present_but_marked() {
        let mut state = CycleState::new();
        skip_post_filter_state(&mut state);
        let post = get_post_filter_state(&mut state).unwrap();
        assert!(post.skip);

        let mut empty = CycleState::new();
        assert!(get_post_filter_state(&mut empty).is_err());
    }
}
