//! Pipeline scenario tests for the extract and reprocess workers
//!
//! The LLM is a scripted fake; everything else (store, queue, matcher,
//! projection writer) is real. Each test mirrors the runner's behaviour
//! by applying the worker outcome to the queue itself.

use super::*;
use crate::llm::FakeLlmClient;
use crate::queue::{EnqueueOptions, JobStatus};
use crate::store::types::NoteKind;
use std::sync::Arc;

fn harness() -> (tempfile::TempDir, Arc<Store>, Arc<JobQueue>) {
    let (dir, store) = Store::open_temp().unwrap();
    let store = Arc::new(store);
    let queue = Arc::new(JobQueue::new(store.clone()));
    (dir, store, queue)
}

/// Enqueue + claim an extract job, run the worker, apply the outcome to
/// the queue the way the runner would, and return the outcome.
async fn run_extract(
    store: &Arc<Store>,
    queue: &Arc<JobQueue>,
    event_id: &str,
    transcript: &str,
    llm: Arc<FakeLlmClient>,
) -> (Job, WorkerOutcome) {
    let worker = ExtractWorker::new(store.clone(), queue.clone(), llm);
    queue
        .enqueue(
            Some(event_id),
            &JobPayload::Extract {
                transcript: transcript.to_string(),
                language: None,
            },
            EnqueueOptions::default(),
        )
        .unwrap();
    let job = queue.claim().unwrap().unwrap();
    let payload = job.payload().unwrap();
    let outcome = worker
        .run(&job, payload, &crate::runner::WorkerContext::detached())
        .await;
    apply(queue, &job, &outcome);
    (job, outcome)
}

async fn run_reprocess(
    store: &Arc<Store>,
    queue: &Arc<JobQueue>,
    event_id: &str,
    epic_id: &str,
    llm: Arc<FakeLlmClient>,
) -> (Job, WorkerOutcome) {
    let worker = ReprocessWorker::new(store.clone(), queue.clone(), llm);
    queue
        .enqueue(
            Some(event_id),
            &JobPayload::Reprocess {
                epic_id: epic_id.to_string(),
                transcript: None,
            },
            EnqueueOptions::default(),
        )
        .unwrap();
    // Skip over unrelated queued jobs (push fan-out from earlier runs).
    let job = loop {
        let job = queue.claim().unwrap().unwrap();
        if job.job_type == crate::queue::JobType::Reprocess {
            break job;
        }
        queue.complete(&job.id, None).unwrap();
    };
    let payload = job.payload().unwrap();
    let outcome = worker
        .run(&job, payload, &crate::runner::WorkerContext::detached())
        .await;
    apply(queue, &job, &outcome);
    (job, outcome)
}

fn apply(queue: &JobQueue, job: &Job, outcome: &WorkerOutcome) {
    match outcome {
        WorkerOutcome::Success(result) => queue.complete(&job.id, result.as_ref()).map(|_| ()),
        WorkerOutcome::Failure { message, retryable } => {
            queue.fail(&job.id, message, *retryable).map(|_| ())
        }
    }
    .unwrap();
}

fn seeded_event(store: &Store, id: &str, transcript: &str) {
    store.create_event(id, "/tmp/audio.ogg", Some("es")).unwrap();
    store
        .set_transcript(id, transcript, "2999-01-01T00:00:00.000Z")
        .unwrap();
    store
        .set_event_status(id, EventStatus::Transcribed, None)
        .unwrap();
}

const S1_RESPONSE: &str = r#"{
    "labels": ["ActionItem"],
    "resolved_epic": {"epic_id": "E1", "confidence": 0.9},
    "epic_mentions": [],
    "new_actions": [{
        "type": "follow_up",
        "title": "Check DB migration",
        "priority": "P1",
        "due_at": null,
        "mentions": ["Ana"],
        "body": ""
    }],
    "new_deadlines": [],
    "blockers": [],
    "dependencies": [],
    "issues": [],
    "knowledge_items": [],
    "email_drafts": [],
    "needs_review": false,
    "evidence_snippets": ["Check DB migration"]
}"#;

/// S1 - happy path: confident model resolution, one action with one
/// mention, event completed, candidates cleared.
#[tokio::test]
async fn s1_happy_path() {
    let (_dir, store, queue) = harness();
    store.create_epic("E1", "Payments", None).unwrap();
    seeded_event(&store, "ev", "Revisemos la migración de la base con Ana");

    let llm = Arc::new(FakeLlmClient::new(vec![Ok(S1_RESPONSE.into())]));
    let (job, outcome) = run_extract(&store, &queue, "ev", "Revisemos la migración", llm).await;

    assert!(matches!(outcome, WorkerOutcome::Success(_)));
    assert_eq!(queue.get(&job.id).unwrap().unwrap().status, JobStatus::Completed);

    let event = store.get_event("ev").unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.epic_id.as_deref(), Some("E1"));

    let actions = store.actions_for_event("ev").unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].title, "Check DB migration");
    assert_eq!(actions[0].mentions, vec!["Ana".to_string()]);
    assert_eq!(actions[0].epic_id.as_deref(), Some("E1"));

    // Candidates cleared on success.
    assert!(store.candidates_for_event("ev").unwrap().is_empty());

    // One run row for the extract stage.
    let runs = store.runs_for_event("ev").unwrap();
    let extract_runs: Vec<_> = runs.iter().filter(|r| r.job_type == "extract").collect();
    assert_eq!(extract_runs.len(), 1);
    assert_eq!(extract_runs[0].status, "success");

    // P1 action fans out a push job.
    let jobs = queue.jobs_for_event("ev").unwrap();
    assert!(jobs
        .iter()
        .any(|j| j.job_type == crate::queue::JobType::Push));
}

/// S2 - two near-identical epics, no alias hit, model declines to
/// resolve: candidates persisted with ranks, no projections, event in
/// needs_review.
#[tokio::test]
async fn s2_ambiguous_epic() {
    let (_dir, store, queue) = harness();
    store
        .create_epic("A", "Checkout Flow Alpha", Some("checkout funnel work"))
        .unwrap();
    store
        .create_epic("B", "Checkout Flow Beta", Some("checkout funnel work"))
        .unwrap();
    seeded_event(&store, "ev", "notes about the checkout funnel work");

    let llm = Arc::new(FakeLlmClient::new(vec![Ok("{}".into())]));
    let (_job, outcome) = run_extract(
        &store,
        &queue,
        "ev",
        "notes about the checkout funnel work",
        llm,
    )
    .await;

    assert!(matches!(outcome, WorkerOutcome::Success(_)));
    let event = store.get_event("ev").unwrap().unwrap();
    assert_eq!(event.status, EventStatus::NeedsReview);

    let candidates = store.candidates_for_event("ev").unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].rank, 1);
    assert_eq!(candidates[1].rank, 2);

    assert!(store.actions_for_event("ev").unwrap().is_empty());
    assert!(store.knowledge_for_event("ev").unwrap().is_empty());
}

/// S3 - malformed JSON three times: job fails non-retryably, event
/// failed with a reason naming the attempt count, no projections.
#[tokio::test]
async fn s3_invalid_output_thrice() {
    let (_dir, store, queue) = harness();
    store.create_epic("E1", "Payments", None).unwrap();
    seeded_event(&store, "ev", "some memo");

    let llm = Arc::new(FakeLlmClient::new(vec![
        Ok("not json at all".into()),
        Ok("{\"labels\": [\"NotALabel\"]}".into()),
        Ok("{still broken".into()),
    ]));
    let (job, outcome) = run_extract(&store, &queue, "ev", "some memo", llm).await;

    match outcome {
        WorkerOutcome::Failure { retryable, .. } => assert!(!retryable),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(queue.get(&job.id).unwrap().unwrap().status, JobStatus::Failed);

    let event = store.get_event("ev").unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event
        .status_reason
        .unwrap()
        .starts_with("Failed after 3 attempts"));

    assert!(store.actions_for_event("ev").unwrap().is_empty());
    assert_eq!(queue.list_dead_letters(10).unwrap().len(), 1);
}

/// S4 - LLM unavailable: retryable failure, job walks through retry
/// with roughly 1 then 2 minute backoff.
#[tokio::test]
async fn s4_transient_llm_outage() {
    let (_dir, store, queue) = harness();
    seeded_event(&store, "ev", "some memo");

    let llm = Arc::new(FakeLlmClient::unavailable());
    let (job, outcome) = run_extract(&store, &queue, "ev", "some memo", llm.clone()).await;

    match outcome {
        WorkerOutcome::Failure { retryable, .. } => assert!(retryable),
        other => panic!("expected failure, got {:?}", other),
    }

    let after_first = queue.get(&job.id).unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Retry);
    let delay1 = delay_secs(&after_first.run_at);
    assert!((55..=65).contains(&delay1), "first delay {}s", delay1);

    // Rewind and fail again: backoff doubles.
    store
        .writer()
        .execute(
            "UPDATE jobs SET run_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
            rusqlite::params![job.id],
        )
        .unwrap();
    let worker = ExtractWorker::new(store.clone(), queue.clone(), llm);
    let job2 = queue.claim().unwrap().unwrap();
    let payload = job2.payload().unwrap();
    let outcome = worker
        .run(&job2, payload, &crate::runner::WorkerContext::detached())
        .await;
    apply(&queue, &job2, &outcome);

    let after_second = queue.get(&job.id).unwrap().unwrap();
    assert_eq!(after_second.status, JobStatus::Retry);
    let delay2 = delay_secs(&after_second.run_at);
    assert!((115..=125).contains(&delay2), "second delay {}s", delay2);
}

fn delay_secs(run_at: &str) -> i64 {
    (crate::queue::parse_ts(run_at).unwrap() - chrono::Utc::now()).num_seconds()
}

const S6_FIRST: &str = r#"{
    "resolved_epic": {"epic_id": "E1", "confidence": 0.95},
    "new_actions": [{"type": "follow_up", "title": "Original action", "priority": "P2",
                     "mentions": [], "body": ""}],
    "knowledge_items": [{"title": "Original note", "kind": "tech", "tags": [],
                         "body_md": "original"}]
}"#;

const S6_SECOND: &str = r#"{
    "new_actions": [{"type": "follow_up", "title": "Replacement action", "priority": "P2",
                     "mentions": [], "body": ""}],
    "blockers": [{"description": "replacement blocker"}]
}"#;

/// S6 - reprocess with a different epic replaces every projection and
/// completes the event.
#[tokio::test]
async fn s6_reprocess_overrides() {
    let (_dir, store, queue) = harness();
    store.create_epic("E1", "Payments", None).unwrap();
    store.create_epic("E2", "Search", None).unwrap();
    seeded_event(&store, "ev", "memo about payments");

    let llm = Arc::new(FakeLlmClient::new(vec![Ok(S6_FIRST.into())]));
    run_extract(&store, &queue, "ev", "memo about payments", llm).await;

    assert_eq!(store.actions_for_event("ev").unwrap().len(), 1);
    assert_eq!(store.knowledge_for_event("ev").unwrap().len(), 1);

    let llm = Arc::new(FakeLlmClient::new(vec![Ok(S6_SECOND.into())]));
    let (_job, outcome) = run_reprocess(&store, &queue, "ev", "E2", llm).await;
    assert!(matches!(outcome, WorkerOutcome::Success(_)));

    let event = store.get_event("ev").unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.epic_id.as_deref(), Some("E2"));

    let actions = store.actions_for_event("ev").unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].title, "Replacement action");
    assert_eq!(actions[0].epic_id.as_deref(), Some("E2"));
    assert!(store.knowledge_for_event("ev").unwrap().is_empty());
    assert_eq!(
        store.notes_for_event(NoteKind::Blocker, "ev").unwrap().len(),
        1
    );
    assert!(store.candidates_for_event("ev").unwrap().is_empty());

    // Reprocess is idempotent: running it again with the same output
    // converges to the same projection set.
    let llm = Arc::new(FakeLlmClient::new(vec![Ok(S6_SECOND.into())]));
    run_reprocess(&store, &queue, "ev", "E2", llm).await;
    assert_eq!(store.actions_for_event("ev").unwrap().len(), 1);
    assert_eq!(
        store.notes_for_event(NoteKind::Blocker, "ev").unwrap().len(),
        1
    );
}

/// Missing transcript is an input error: non-retryable, event failed.
#[tokio::test]
async fn missing_transcript_is_fatal() {
    let (_dir, store, queue) = harness();
    store.create_event("ev", "/tmp/a.ogg", None).unwrap();

    let llm = Arc::new(FakeLlmClient::new(vec![]));
    let (job, outcome) = run_extract(&store, &queue, "ev", "", llm).await;

    match outcome {
        WorkerOutcome::Failure { retryable, message } => {
            assert!(!retryable);
            assert!(message.contains("missing transcript"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(queue.get(&job.id).unwrap().unwrap().status, JobStatus::Failed);
    assert_eq!(
        store.get_event("ev").unwrap().unwrap().status,
        EventStatus::Failed
    );
}

/// "file this under X" routes by the named epic alias.
#[tokio::test]
async fn detected_command_forces_alias_match() {
    let (_dir, store, queue) = harness();
    store.create_epic("E1", "Payments", None).unwrap();
    store.add_epic_alias("E1", "billing").unwrap();
    seeded_event(&store, "ev", "File this under billing.\nInvoice retries are broken");

    let llm = Arc::new(FakeLlmClient::new(vec![Ok("{}".into())]));
    let (_job, outcome) = run_extract(
        &store,
        &queue,
        "ev",
        "File this under billing.\nInvoice retries are broken",
        llm,
    )
    .await;

    assert!(matches!(outcome, WorkerOutcome::Success(_)));
    let event = store.get_event("ev").unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.epic_id.as_deref(), Some("E1"));
    assert_eq!(
        event.detected_command.as_deref(),
        Some("assign_epic:billing")
    );
}

#[test]
fn command_detection_parses_the_first_line() {
    assert_eq!(
        detect_command("file this under payments\nrest of memo"),
        Some("payments".to_string())
    );
    assert_eq!(
        detect_command("Put this under Search Revamp."),
        Some("search revamp".to_string())
    );
    assert_eq!(detect_command("regular memo text"), None);
    assert_eq!(detect_command(""), None);
}
