//! Extraction stage: extract and reprocess workers
//!
//! Builds the prompt, calls the LLM with a bounded retry-on-invalid-JSON
//! loop, validates the response, and projects it into the typed tables
//! idempotently. The extract worker routes the event through the epic
//! matcher; the reprocess worker bypasses it with a forced epic.

pub mod prompt;
pub mod schema;

#[cfg(test)]
mod tests;

use crate::llm::{ChatMessage, ChatParams, LlmClient};
use crate::matcher;
use crate::queue::{EnqueueOptions, Job, JobPayload, JobQueue};
use crate::runner::{Worker, WorkerContext, WorkerOutcome};
use crate::store::projections::{ActionInsert, KnowledgeInsert, NoteInsert, ProjectionBatch};
use crate::store::runs::RunRecord;
use crate::store::types::{ActionType, Event, EventStatus, Priority, RunStatus};
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use schema::ExtractionOutput;
use std::sync::Arc;
use std::time::Instant;

/// Attempts within one job before the response is declared unrecoverable.
const CALL_ATTEMPTS: usize = 3;

/// A model answer with at least this confidence overrides the matcher.
const RESOLVED_CONFIDENCE_FLOOR: f64 = 0.80;

enum CallError {
    /// LLM not ready or transport failed; the queue should back off.
    Transient(String),
    /// Three invalid responses in a row.
    Exhausted { last_error: String },
}

/// Shared core of the extract and reprocess workers.
pub struct Extractor {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    llm: Arc<dyn LlmClient>,
}

impl Extractor {
    pub fn new(store: Arc<Store>, queue: Arc<JobQueue>, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, queue, llm }
    }

    /// Run the bounded call loop: ask, parse, validate; on failure feed
    /// the error back in a retry prompt.
    async fn call_llm(&self, user_prompt: String) -> Result<ExtractionOutput, CallError> {
        if !self.llm.is_ready().await {
            return Err(CallError::Transient("LLM server is not ready".into()));
        }

        let mut messages = vec![
            ChatMessage::system(prompt::SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ];
        let mut last_error = String::new();

        for attempt in 1..=CALL_ATTEMPTS {
            let response = self
                .llm
                .chat(&messages, ChatParams::default())
                .await
                .map_err(|e| CallError::Transient(e.to_string()))?;

            match schema::parse_response(&response) {
                Ok(output) => return Ok(output),
                Err(error) => {
                    tracing::warn!(attempt, "Extractor got invalid response: {}", error);
                    messages.push(ChatMessage {
                        role: "assistant".into(),
                        content: response.clone(),
                    });
                    messages.push(ChatMessage::user(prompt::build_retry_prompt(
                        &response, &error,
                    )));
                    last_error = error;
                }
            }
        }

        Err(CallError::Exhausted { last_error })
    }

    /// Convert the validated output into a projection batch. Deadlines
    /// become actions of type `deadline`; email drafts become actions of
    /// type `email` at P2.
    fn to_batch(output: &ExtractionOutput) -> ProjectionBatch {
        let mut actions: Vec<ActionInsert> = output
            .new_actions
            .iter()
            .map(|a| ActionInsert {
                action_type: a.action_type,
                title: a.title.clone(),
                body: Some(a.body.clone()).filter(|b| !b.is_empty()),
                priority: a.priority,
                due_at: a.due_at.clone(),
                mentions: a.mentions.clone(),
            })
            .collect();
        actions.extend(output.new_deadlines.iter().map(|d| ActionInsert {
            action_type: ActionType::Deadline,
            title: d.title.clone(),
            body: None,
            priority: d.priority,
            due_at: Some(d.due_at.clone()),
            mentions: Vec::new(),
        }));
        actions.extend(output.email_drafts.iter().map(|e| ActionInsert {
            action_type: ActionType::Email,
            title: e.subject.clone(),
            body: Some(e.body.clone()),
            priority: Priority::P2,
            due_at: None,
            mentions: Vec::new(),
        }));

        let note = |n: &schema::NewNote| NoteInsert {
            description: n.description.clone(),
        };
        ProjectionBatch {
            actions,
            blockers: output.blockers.iter().map(note).collect(),
            dependencies: output.dependencies.iter().map(note).collect(),
            issues: output.issues.iter().map(note).collect(),
            knowledge: output
                .knowledge_items
                .iter()
                .map(|k| KnowledgeInsert {
                    title: k.title.clone(),
                    kind: k.kind,
                    tags: k.tags.clone(),
                    body_md: k.body_md.clone(),
                })
                .collect(),
        }
    }

    /// Write the projections, then fan out push jobs for fresh P0/P1
    /// actions (policy: only urgent actions notify).
    fn project(&self, event_id: &str, epic_id: Option<&str>, output: &ExtractionOutput) -> Result<()> {
        let inserted = self
            .store
            .replace_projections(event_id, epic_id, &Self::to_batch(output))?;
        for action in inserted {
            if action.priority.is_notifiable() {
                self.queue.enqueue(
                    Some(event_id),
                    &JobPayload::Push {
                        action_id: action.id,
                        event_id: event_id.to_string(),
                    },
                    EnqueueOptions::default(),
                )?;
            }
        }
        Ok(())
    }

    fn record(
        &self,
        event_id: &str,
        job_type: &str,
        status: RunStatus,
        input: &str,
        output: Option<&str>,
        error: Option<&str>,
        started: Instant,
    ) {
        let _ = self.store.record_run(&RunRecord {
            event_id,
            job_type,
            status,
            input_snapshot: Some(input),
            output_snapshot: output,
            error_message: error,
            duration_ms: Some(started.elapsed().as_millis() as i64),
        });
    }

    /// Resolve which epic the projections bind to: the model's answer
    /// wins when confident and real, otherwise the matcher's unambiguous
    /// top candidate.
    fn resolve_epic(
        &self,
        output: &ExtractionOutput,
        matcher_top: Option<&str>,
    ) -> Result<(Option<String>, bool)> {
        if let Some(resolved) = &output.resolved_epic {
            if resolved.confidence >= RESOLVED_CONFIDENCE_FLOOR
                && self.store.get_epic(&resolved.epic_id)?.is_some()
            {
                return Ok((Some(resolved.epic_id.clone()), true));
            }
        }
        Ok((matcher_top.map(String::from), false))
    }

    async fn run_extract(&self, event: &Event, transcript: &str) -> Result<WorkerOutcome> {
        let started = Instant::now();
        let event_id = event.id.as_str();
        let input_snapshot =
            serde_json::json!({ "transcript_chars": transcript.chars().count() }).to_string();

        self.store
            .set_event_status(event_id, EventStatus::Processing, None)?;

        // Operator commands at the head of the memo short-circuit the
        // matcher query; "file this under payments" should route by the
        // named epic, not by the memo body.
        let match_query = match detect_command(transcript) {
            Some(target) => {
                self.store
                    .set_detected_command(event_id, &format!("assign_epic:{}", target))?;
                target
            }
            None => transcript.to_string(),
        };

        let match_outcome = matcher::match_epics(&self.store, &match_query)?;
        matcher::persist_candidates(&self.store, event_id, &match_outcome)?;

        let bound_epic = if match_outcome.needs_review {
            None
        } else {
            match_outcome.top().map(|c| c.epic_id.clone())
        };
        let snapshot = match &bound_epic {
            Some(epic_id) => self
                .store
                .get_epic(epic_id)?
                .map(|epic| prompt::build_epic_snapshot(&self.store, epic))
                .transpose()?,
            None => None,
        };

        let user_prompt = prompt::build_user_prompt(&self.store, snapshot.as_ref(), transcript)?;

        let output = match self.call_llm(user_prompt).await {
            Ok(output) => output,
            Err(CallError::Transient(message)) => {
                self.record(
                    event_id,
                    "extract",
                    RunStatus::Retry,
                    &input_snapshot,
                    None,
                    Some(&message),
                    started,
                );
                return Ok(WorkerOutcome::retryable(message));
            }
            Err(CallError::Exhausted { last_error }) => {
                let reason = format!("Failed after {} attempts: {}", CALL_ATTEMPTS, last_error);
                self.store
                    .set_event_status(event_id, EventStatus::Failed, Some(&reason))?;
                self.record(
                    event_id,
                    "extract",
                    RunStatus::Error,
                    &input_snapshot,
                    None,
                    Some(&reason),
                    started,
                );
                return Ok(WorkerOutcome::fatal(reason));
            }
        };

        let (resolved_epic, model_resolved) =
            self.resolve_epic(&output, bound_epic.as_deref())?;
        let needs_review =
            output.needs_review || (match_outcome.needs_review && !model_resolved);

        let output_snapshot = serde_json::to_string(&output).unwrap_or_default();

        if needs_review {
            self.store.set_event_status(
                event_id,
                EventStatus::NeedsReview,
                Some("epic match ambiguous or model requested review"),
            )?;
            self.record(
                event_id,
                "extract",
                RunStatus::Success,
                &input_snapshot,
                Some(&output_snapshot),
                None,
                started,
            );
            return Ok(WorkerOutcome::Success(Some(
                serde_json::json!({ "needs_review": true }),
            )));
        }

        self.store
            .set_event_epic(event_id, resolved_epic.as_deref())?;
        self.project(event_id, resolved_epic.as_deref(), &output)?;
        self.store
            .set_event_status(event_id, EventStatus::Completed, None)?;
        self.store.clear_candidates(event_id)?;

        self.record(
            event_id,
            "extract",
            RunStatus::Success,
            &input_snapshot,
            Some(&output_snapshot),
            None,
            started,
        );
        Ok(WorkerOutcome::Success(Some(serde_json::json!({
            "epic_id": resolved_epic,
            "actions": output.new_actions.len() + output.new_deadlines.len()
                + output.email_drafts.len(),
        }))))
    }

    async fn run_reprocess(
        &self,
        event: &Event,
        epic_id: &str,
        transcript: &str,
    ) -> Result<WorkerOutcome> {
        let started = Instant::now();
        let event_id = event.id.as_str();
        let input_snapshot =
            serde_json::json!({ "forced_epic": epic_id, "transcript_chars": transcript.chars().count() })
                .to_string();

        let Some(epic) = self.store.get_epic(epic_id)? else {
            let message = format!("reprocess names unknown epic {}", epic_id);
            self.record(
                event_id,
                "reprocess",
                RunStatus::Error,
                &input_snapshot,
                None,
                Some(&message),
                started,
            );
            return Ok(WorkerOutcome::fatal(message));
        };

        self.store
            .set_event_status(event_id, EventStatus::Processing, None)?;

        let snapshot = prompt::build_epic_snapshot(&self.store, epic)?;
        let user_prompt = prompt::build_user_prompt(&self.store, Some(&snapshot), transcript)?;

        let output = match self.call_llm(user_prompt).await {
            Ok(output) => output,
            Err(CallError::Transient(message)) => {
                self.record(
                    event_id,
                    "reprocess",
                    RunStatus::Retry,
                    &input_snapshot,
                    None,
                    Some(&message),
                    started,
                );
                return Ok(WorkerOutcome::retryable(message));
            }
            Err(CallError::Exhausted { last_error }) => {
                let reason = format!("Failed after {} attempts: {}", CALL_ATTEMPTS, last_error);
                self.store
                    .set_event_status(event_id, EventStatus::Failed, Some(&reason))?;
                self.record(
                    event_id,
                    "reprocess",
                    RunStatus::Error,
                    &input_snapshot,
                    None,
                    Some(&reason),
                    started,
                );
                return Ok(WorkerOutcome::fatal(reason));
            }
        };

        // The epic is forced: the model's own resolution is ignored and
        // the event always completes on success.
        self.store.set_event_epic(event_id, Some(epic_id))?;
        self.project(event_id, Some(epic_id), &output)?;
        self.store
            .set_event_status(event_id, EventStatus::Completed, None)?;
        self.store.clear_candidates(event_id)?;

        let output_snapshot = serde_json::to_string(&output).unwrap_or_default();
        self.record(
            event_id,
            "reprocess",
            RunStatus::Success,
            &input_snapshot,
            Some(&output_snapshot),
            None,
            started,
        );
        Ok(WorkerOutcome::Success(Some(
            serde_json::json!({ "epic_id": epic_id }),
        )))
    }
}

/// Recognise an epic-assignment command at the head of a transcript.
/// Returns the named target ("file this under payments" → "payments").
pub fn detect_command(transcript: &str) -> Option<String> {
    let first_line = transcript.lines().next()?.trim();
    let lowered = first_line.to_lowercase();
    for prefix in ["file this under ", "put this under ", "assign this to "] {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            let target = rest.trim_end_matches(['.', '!', ',']).trim();
            if !target.is_empty() {
                return Some(target.to_string());
            }
        }
    }
    None
}

/// Queue worker for `extract` jobs.
pub struct ExtractWorker {
    extractor: Extractor,
    store: Arc<Store>,
}

impl ExtractWorker {
    pub fn new(store: Arc<Store>, queue: Arc<JobQueue>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            extractor: Extractor::new(store.clone(), queue, llm),
            store,
        }
    }
}

#[async_trait]
impl Worker for ExtractWorker {
    async fn run(&self, job: &Job, payload: JobPayload, ctx: &WorkerContext) -> WorkerOutcome {
        let JobPayload::Extract { transcript, .. } = payload else {
            return WorkerOutcome::fatal("extract worker received a non-extract payload");
        };
        let Some(event_id) = job.event_id.as_deref() else {
            return WorkerOutcome::fatal("extract job has no event id");
        };
        if ctx.cancelled() {
            return WorkerOutcome::retryable("cancelled before start");
        }

        let event = match self.store.get_event(event_id) {
            Ok(Some(event)) => event,
            Ok(None) => return WorkerOutcome::fatal(format!("no such event: {}", event_id)),
            Err(e) => return WorkerOutcome::retryable(e.to_string()),
        };

        // Missing transcript is an input error.
        let transcript = if transcript.is_empty() {
            match event.transcript.clone() {
                Some(t) if !t.is_empty() => t,
                _ => {
                    let message = "missing transcript on extract".to_string();
                    let _ = self.store.set_event_status(
                        event_id,
                        EventStatus::Failed,
                        Some(&message),
                    );
                    return WorkerOutcome::fatal(message);
                }
            }
        } else {
            transcript
        };

        match self.extractor.run_extract(&event, &transcript).await {
            Ok(outcome) => outcome,
            Err(e) => WorkerOutcome::retryable(format!("extract failed: {}", e)),
        }
    }
}

/// Queue worker for `reprocess` jobs (operator-forced epic).
pub struct ReprocessWorker {
    extractor: Extractor,
    store: Arc<Store>,
}

impl ReprocessWorker {
    pub fn new(store: Arc<Store>, queue: Arc<JobQueue>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            extractor: Extractor::new(store.clone(), queue, llm),
            store,
        }
    }
}

#[async_trait]
impl Worker for ReprocessWorker {
    async fn run(&self, job: &Job, payload: JobPayload, ctx: &WorkerContext) -> WorkerOutcome {
        let JobPayload::Reprocess {
            epic_id,
            transcript,
        } = payload
        else {
            return WorkerOutcome::fatal("reprocess worker received a non-reprocess payload");
        };
        let Some(event_id) = job.event_id.as_deref() else {
            return WorkerOutcome::fatal("reprocess job has no event id");
        };
        if ctx.cancelled() {
            return WorkerOutcome::retryable("cancelled before start");
        }

        let event = match self.store.get_event(event_id) {
            Ok(Some(event)) => event,
            Ok(None) => return WorkerOutcome::fatal(format!("no such event: {}", event_id)),
            Err(e) => return WorkerOutcome::retryable(e.to_string()),
        };

        let transcript = match transcript.or_else(|| event.transcript.clone()) {
            Some(t) if !t.is_empty() => t,
            _ => {
                let message = "missing transcript on reprocess".to_string();
                let _ = self
                    .store
                    .set_event_status(event_id, EventStatus::Failed, Some(&message));
                return WorkerOutcome::fatal(message);
            }
        };

        match self
            .extractor
            .run_reprocess(&event, &epic_id, &transcript)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => WorkerOutcome::retryable(format!("reprocess failed: {}", e)),
        }
    }
}
