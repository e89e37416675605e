//! Events fanned out to subscribers of the job manager.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::Job;
use crate::progress::JobProgress;

/// Queued events per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobEvent {
    #[serde(rename = "job:added")]
    Added(Job),

    /// Full snapshot after a state transition
    #[serde(rename = "job:state")]
    State(Job),

    #[serde(rename = "job:progress")]
    Progress {
        job_id: Uuid,
        progress: JobProgress,
        message: String,
    },

    #[serde(rename = "job:cancel_requested")]
    CancelRequested { job_id: Uuid },

    #[serde(rename = "job:removed")]
    Removed { job_id: Uuid },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Added(job) | JobEvent::State(job) => job.id,
            JobEvent::Progress { job_id, .. }
            | JobEvent::CancelRequested { job_id }
            | JobEvent::Removed { job_id } => *job_id,
        }
    }
}
