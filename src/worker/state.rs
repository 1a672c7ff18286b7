//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// State of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Collaborators are being wired up; no deliveries are consumed yet.
    Starting,
    /// Consuming deliveries and running jobs.
    Running,
    /// No new deliveries; waiting for in-flight jobs to settle.
    Draining,
    /// Queue closed, process may exit.
    Stopped,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Transitions only move forward. `Starting -> Stopped` covers a failed
    /// startup and `Starting -> Draining` a signal that arrives before the
    /// first delivery is consumed.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Starting, Running)
                | (Starting, Draining)
                | (Starting, Stopped)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether new deliveries may be taken from the queue.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Why the worker stopped consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// A termination signal (or an embedder's shutdown future) fired.
    Signal,
    /// The transport ended the delivery stream.
    QueueClosed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::QueueClosed => write!(f, "queue_closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        use WorkerState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Starting));
        assert!(!Draining.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
    }

    #[test]
    fn only_running_accepts_jobs() {
        assert!(WorkerState::Running.accepts_jobs());
        assert!(!WorkerState::Starting.accepts_jobs());
        assert!(!WorkerState::Draining.accepts_jobs());
        assert!(WorkerState::Stopped.is_terminal());
    }

    #[test]
    fn display_matches_serde() {
        assert_eq!(WorkerState::Draining.to_string(), "draining");
        assert_eq!(
            serde_json::to_value(WorkerState::Stopped).unwrap(),
            serde_json::json!("stopped")
        );
        assert_eq!(ShutdownReason::QueueClosed.to_string(), "queue_closed");
    }
}
