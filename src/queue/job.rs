//! Job rows and their typed payloads

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Stt,
    Extract,
    Reprocess,
    Push,
    TtlCleanup,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Stt => "stt",
            JobType::Extract => "extract",
            JobType::Reprocess => "reprocess",
            JobType::Push => "push",
            JobType::TtlCleanup => "ttl_cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stt" => Some(JobType::Stt),
            "extract" => Some(JobType::Extract),
            "reprocess" => Some(JobType::Reprocess),
            "push" => Some(JobType::Push),
            "ttl_cleanup" => Some(JobType::TtlCleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retry,
    Cancelled,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retry" => Some(JobStatus::Retry),
            "cancelled" => Some(JobStatus::Cancelled),
            "dead_letter" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }
}

/// Typed job payload, persisted as tagged JSON and decoded at claim time.
/// A payload that fails to decode fails the job non-retryably.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Stt {
        audio_path: String,
        #[serde(default)]
        language: Option<String>,
    },
    Extract {
        transcript: String,
        #[serde(default)]
        language: Option<String>,
    },
    Reprocess {
        epic_id: String,
        #[serde(default)]
        transcript: Option<String>,
    },
    Push {
        action_id: String,
        event_id: String,
    },
    TtlCleanup {
        #[serde(default)]
        dry_run: bool,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Stt { .. } => JobType::Stt,
            JobPayload::Extract { .. } => JobType::Extract,
            JobPayload::Reprocess { .. } => JobType::Reprocess,
            JobPayload::Push { .. } => JobType::Push,
            JobPayload::TtlCleanup { .. } => JobType::TtlCleanup,
        }
    }
}

/// A persisted unit of scheduled work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub event_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Raw payload JSON; decode with [`Job::payload`].
    pub payload: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub cancelled_by: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    /// Decode the stored payload into its typed variant.
    pub fn payload(&self) -> anyhow::Result<JobPayload> {
        let raw = self
            .payload
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("job {} has no payload", self.id))?;
        Ok(serde_json::from_str(raw)?)
    }
}

/// An immutable copy of a job that exhausted its attempts or failed
/// non-retryably, preserved for manual re-drive.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub job_id: String,
    pub event_id: Option<String>,
    pub job_type: JobType,
    pub payload: Option<String>,
    pub attempts: i64,
    pub error_message: Option<String>,
    pub reason: Option<String>,
    pub dead_lettered_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrips_through_tagged_json() {
        let payload = JobPayload::Stt {
            audio_path: "/data/uploads/x.ogg".into(),
            language: Some("es".into()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"stt\""));
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let err = serde_json::from_str::<JobPayload>("{\"type\":\"mystery\"}");
        assert!(err.is_err());
    }

    #[test]
    fn payload_type_matches_job_type() {
        assert_eq!(
            JobPayload::TtlCleanup { dry_run: true }.job_type(),
            JobType::TtlCleanup
        );
        assert_eq!(
            JobPayload::Push {
                action_id: "a".into(),
                event_id: "e".into()
            }
            .job_type(),
            JobType::Push
        );
    }
}
