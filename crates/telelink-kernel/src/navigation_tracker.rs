//! [`NavigationTracker`] – consumer-side pose bookkeeping and arrival
//! detection.
//!
//! The tracker stores the target as the only source of the "navigating"
//! flag, so the two can never disagree: a target is present exactly while a
//! navigation is in progress.
//!
//! Pose updates carrying a timestamp older than the last accepted pose are
//! ignored. Equal timestamps are accepted.

use telelink_types::{NavTarget, Pose};

/// A pose strictly closer than this to the target counts as arrival.
pub const ARRIVAL_THRESHOLD: f64 = 0.3;

/// `true` when `pose` is within [`ARRIVAL_THRESHOLD`] of `target`.
pub fn has_arrived(pose: &Pose, target: &NavTarget) -> bool {
    pose.distance_to(target.x, target.y) < ARRIVAL_THRESHOLD
}

/// Result of feeding one pose into the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseOutcome {
    /// Older than the current pose; discarded.
    Stale,
    /// Stored; no arrival.
    Updated,
    /// Stored, and the active target was reached and cleared.
    Arrived(NavTarget),
}

#[derive(Debug, Default, Clone)]
pub struct NavigationTracker {
    pose: Option<Pose>,
    target: Option<NavTarget>,
}

impl NavigationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn target(&self) -> Option<&NavTarget> {
        self.target.as_ref()
    }

    pub fn is_navigating(&self) -> bool {
        self.target.is_some()
    }

    /// Start tracking `target`, replacing any previous one.
    pub fn begin(&mut self, target: NavTarget) {
        self.target = Some(target);
    }

    /// Stop navigating. Returns the target that was active, if any.
    pub fn clear(&mut self) -> Option<NavTarget> {
        self.target.take()
    }

    /// Forget the pose as well as the target (link went away).
    pub fn reset(&mut self) {
        self.pose = None;
        self.target = None;
    }

    pub fn on_pose(&mut self, pose: Pose) -> PoseOutcome {
        if let Some(current) = &self.pose
            && pose.timestamp < current.timestamp
        {
            return PoseOutcome::Stale;
        }
        self.pose = Some(pose);

        let arrived = self.target.as_ref().is_some_and(|t| has_arrived(&pose, t));
        match self.target.take_if(|_| arrived) {
            Some(target) => PoseOutcome::Arrived(target),
            None => PoseOutcome::Updated,
        }
    }
}
