use crate::error::ErrorKind;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// States a job passes through
///
/// `ContextReleased` always precedes `Succeeded` or `Failed` once a context
/// was acquired. A job rejected by validation goes `Created -> Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum JobState {
    Created,
    ContextAcquired,
    ContentLoaded,
    Navigated,
    ReadinessEvaluated { degraded: bool },
    Captured,
    ContextReleased,
    Succeeded,
    Failed { kind: ErrorKind },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("created"),
            JobState::ContextAcquired => f.write_str("context_acquired"),
            JobState::ContentLoaded => f.write_str("content_loaded"),
            JobState::Navigated => f.write_str("navigated"),
            JobState::ReadinessEvaluated { degraded: false } => f.write_str("ready"),
            JobState::ReadinessEvaluated { degraded: true } => f.write_str("ready (degraded)"),
            JobState::Captured => f.write_str("captured"),
            JobState::ContextReleased => f.write_str("context_released"),
            JobState::Succeeded => f.write_str("succeeded"),
            JobState::Failed { kind } => write!(f, "failed ({kind})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Transition {
        job_id: String,
        correlation_id: String,
        state: JobState,
    },
    #[serde(rename_all = "camelCase")]
    ReadinessDegraded {
        job_id: String,
        correlation_id: String,
        signal: String,
        reason: String,
    },
}

impl JobEvent {
    pub fn state(&self) -> Option<&JobState> {
        match self {
            JobEvent::Transition { state, .. } => Some(state),
            JobEvent::ReadinessDegraded { .. } => None,
        }
    }
}

/// Event sink for job progress
#[cfg_attr(test, mockall::automock)]
pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

/// Logs transitions at DEBUG
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn on_event(&self, event: &JobEvent) {
        match event {
            JobEvent::Transition { job_id, state, .. } => {
                debug!("Job {} -> {}", job_id, state);
            }
            JobEvent::ReadinessDegraded {
                job_id,
                signal,
                reason,
                ..
            } => {
                debug!("Job {} readiness signal {} degraded: {}", job_id, signal, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed {
            kind: ErrorKind::InternalError
        }
        .is_terminal());
        assert!(!JobState::ContextReleased.is_terminal());
    }

    #[test]
    fn events_serialize_with_tags() {
        let event = JobEvent::Transition {
            job_id: "j1".to_string(),
            correlation_id: "c1".to_string(),
            state: JobState::ReadinessEvaluated { degraded: true },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transition");
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["state"]["state"], "readinessEvaluated");
        assert_eq!(json["state"]["degraded"], true);
    }
}
