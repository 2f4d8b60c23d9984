//! Minimal scheduler-framework surface the plugin is driven through.
//!
//! The real scheduler owns these types; the engine only needs the admission
//! verdict and a per-cycle typed blackboard that deep-copies when the
//! scheduler clones the cycle state.

use std::any::Any;
use std::collections::HashMap;

/// Verdict of an admission hook. A quota violation is always
/// `Unschedulable`, never `Error`; `Error` marks internal faults only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Unschedulable(String),
    Error(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn message(&self) -> &str {
        match self {
            Status::Success => "",
            Status::Unschedulable(message) | Status::Error(message) => message,
        }
    }
}

/// Data stored in a [`CycleState`]. Implementors provide deep cloning so the
/// scheduler can fork the state for parallel evaluation.
pub trait StateData: Send + Sync {
    fn clone_box(&self) -> Box<dyn StateData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Per-scheduling-cycle key-value store. Owned by one cycle, never shared
/// across cycles, so it needs no lock.
#[derive(Default)]
pub struct CycleState {
    data: HashMap<String, Box<dyn StateData>>,
}

impl Clone for CycleState {
    fn clone(&self) -> Self {
        Self {
            data: self
                .data
                .iter()
                .map(|(key, value)| (key.clone(), value.clone_box()))
                .collect(),
        }
    }
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, key: &str, value: Box<dyn StateData>) {
        self.data.insert(key.to_string(), value);
    }

    pub fn read<T: 'static>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|value| value.as_any().downcast_ref())
    }

    pub fn read_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.data
            .get_mut(key)
            .and_then(|value| value.as_any_mut().downcast_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    impl StateData for Marker {
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

    #[test]
    fn cycle_state_clone_is_deep() {
        let mut state = CycleState::new();
        state.write("marker", Box::new(Marker(1)));

        let mut copy = state.clone();
        copy.read_mut::<Marker>("marker").unwrap().0 = 2;

        assert_eq!(state.read::<Marker>("marker"), Some(&Marker(1)));
        assert_eq!(copy.read::<Marker>("marker"), Some(&Marker(2)));
    }

    #[test]
    fn status_accessors() {
        assert!(Status::Success.is_success());
        let denied = Status::Unschedulable("no quota".to_string());
        assert!(!denied.is_success());
        assert_eq!(denied.message(), "no quota");
    }
}
