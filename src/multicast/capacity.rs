use std::sync::Arc;

use tracing::debug;

use crate::multicast::flow_control::FlowGate;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapacityTransition {
    Locked,
    Unlocked,
}

/// Tracks the number of bytes buffered in a queue and derives a lock signal from it, with
///  hysteresis: the queue locks when its capacity reaches `min_lock_capacity`, and it unlocks
///  only after dropping to `max_unlock_capacity` or below.
///
/// Transitions are reported in two ways:
/// * an optional [FlowGate] is written immediately - this is how a local producer running in a
///   different task learns that it should hold off
/// * the owner polls [QueueCapacityController::poll_transition] after operating on the queue
///   and propagates the net change, e.g. to a remote producer
pub struct QueueCapacityController {
    min_lock_capacity: usize,
    max_unlock_capacity: usize,
    capacity: usize,
    locked: bool,
    reported_locked: bool,
    gate: Option<Arc<FlowGate>>,
}

impl QueueCapacityController {
    pub fn new(min_lock_capacity: usize, max_unlock_capacity: usize) -> QueueCapacityController {
        assert!(max_unlock_capacity <= min_lock_capacity, "unlock threshold must not exceed lock threshold");

        QueueCapacityController {
            min_lock_capacity,
            max_unlock_capacity,
            capacity: 0,
            locked: false,
            reported_locked: false,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<FlowGate>) -> QueueCapacityController {
        self.gate = Some(gate);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn add(&mut self, bytes: usize) {
        self.capacity += bytes;

        if !self.locked && self.capacity >= self.min_lock_capacity {
            debug!("queue capacity {} reached lock threshold {}", self.capacity, self.min_lock_capacity);
            self.locked = true;
            if let Some(gate) = &self.gate {
                gate.lock();
            }
        }
    }

    pub fn remove(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.capacity);
        self.capacity = self.capacity.saturating_sub(bytes);
        self.check_unlock();
    }

    pub fn clear(&mut self) {
        self.capacity = 0;
        self.check_unlock();
    }

    fn check_unlock(&mut self) {
        if self.locked && self.capacity <= self.max_unlock_capacity {
            debug!("queue capacity {} dropped to unlock threshold {}", self.capacity, self.max_unlock_capacity);
            self.locked = false;
            if let Some(gate) = &self.gate {
                gate.unlock();
            }
        }
    }

    /// returns the net change of the lock state since the previous call, if any
    pub fn poll_transition(&mut self) -> Option<CapacityTransition> {
        if self.locked == self.reported_locked {
            return None;
        }
        self.reported_locked = self.locked;
        if self.locked {
            Some(CapacityTransition::Locked)
        }
        else {
            Some(CapacityTransition::Unlocked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::below(vec![50], false)]
    #[case::reaches_lock(vec![100], true)]
    #[case::accumulates(vec![60, 40], true)]
    #[case::drops_into_hysteresis(vec![120, -50], true)]
    #[case::drops_to_unlock(vec![120, -70], false)]
    #[case::relock(vec![120, -100, 90], true)]
    #[case::no_chatter_at_lock_boundary(vec![100, -1, 1, -1], true)]
    fn test_hysteresis(#[case] deltas: Vec<i64>, #[case] expected_locked: bool) {
        let mut controller = QueueCapacityController::new(100, 50);
        for d in deltas {
            if d >= 0 {
                controller.add(d as usize);
            }
            else {
                controller.remove((-d) as usize);
            }
        }
        assert_eq!(controller.is_locked(), expected_locked);
    }

    #[test]
    fn test_poll_transition_reports_net_change() {
        let mut controller = QueueCapacityController::new(100, 50);
        assert_eq!(controller.poll_transition(), None);

        controller.add(150);
        assert_eq!(controller.poll_transition(), Some(CapacityTransition::Locked));
        assert_eq!(controller.poll_transition(), None);

        controller.remove(120);
        controller.add(100);
        assert_eq!(controller.poll_transition(), None);
        assert!(controller.is_locked());

        controller.clear();
        assert_eq!(controller.poll_transition(), Some(CapacityTransition::Unlocked));
        assert_eq!(controller.capacity(), 0);
    }

    #[test]
    fn test_gate_follows_lock_state() {
        let gate = Arc::new(FlowGate::new());
        let mut controller = QueueCapacityController::new(10, 5).with_gate(gate.clone());

        controller.add(10);
        assert!(gate.is_locked());
        controller.remove(4);
        assert!(gate.is_locked());
        controller.remove(1);
        assert!(!gate.is_locked());
    }
}
