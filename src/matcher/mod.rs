//! Epic matcher
//!
//! Routes a transcript to its epic. An exact alias hit wins outright;
//! otherwise ranked FTS over active epics produces up to three scored
//! candidates and an ambiguity verdict the extractor uses to decide
//! whether the memo needs operator review.

use crate::store::types::EpicCandidate;
use crate::store::Store;
use anyhow::Result;
use serde::Serialize;

/// FTS hits considered per query.
const DEFAULT_TOP_N: usize = 3;

/// Confidence for an exact alias hit on an active epic.
const EXACT_CONFIDENCE: f64 = 0.95;

/// Base confidence ladder for FTS hits by position.
const FTS_CONFIDENCE: [f64; 3] = [0.80, 0.60, 0.40];

/// Top-1 must clear this alone to avoid review.
const SOLO_CONFIDENCE_FLOOR: f64 = 0.80;

/// Two candidates closer than this are ambiguous.
const AMBIGUITY_GAP: f64 = 0.20;

/// bm25 scores this close count as a tie; the later hit keeps the
/// earlier base confidence so the ambiguity test can see the tie.
const SCORE_TIE_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Fts,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Fts => "fts",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub epic_id: String,
    pub title: String,
    pub confidence: f64,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub candidates: Vec<MatchCandidate>,
    pub needs_review: bool,
    /// top1.confidence − top2.confidence; 0 with fewer than two hits.
    pub confidence_gap: f64,
}

impl MatchOutcome {
    pub fn top(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

/// Rank candidate epics for a query string (typically a transcript).
/// Deterministic for a fixed query and epic/alias set.
pub fn match_epics(store: &Store, query: &str) -> Result<MatchOutcome> {
    // Stage 1: exact alias lookup short-circuits everything else.
    if let Some(epic) = store.find_epic_by_alias(query)? {
        let candidate = MatchCandidate {
            epic_id: epic.id,
            title: epic.title,
            confidence: EXACT_CONFIDENCE,
            match_kind: MatchKind::Exact,
        };
        return Ok(MatchOutcome {
            candidates: vec![candidate],
            needs_review: false,
            confidence_gap: 0.0,
        });
    }

    // Stage 2: ranked FTS over active epics.
    let hits = store.search_epics(query, DEFAULT_TOP_N)?;

    // Stage 3: fixed confidence ladder with linear decay by position.
    let confidences = assign_confidences(&hits.iter().map(|h| h.rank).collect::<Vec<_>>());
    let candidates: Vec<MatchCandidate> = hits
        .into_iter()
        .zip(confidences)
        .map(|(hit, confidence)| MatchCandidate {
            epic_id: hit.content_id,
            title: hit.title,
            confidence,
            match_kind: MatchKind::Fts,
        })
        .collect();

    // Stage 4: ambiguity test.
    let confidence_gap = match candidates.as_slice() {
        [first, second, ..] => first.confidence - second.confidence,
        _ => 0.0,
    };
    let needs_review = match candidates.len() {
        0 => true,
        1 => candidates[0].confidence < SOLO_CONFIDENCE_FLOOR,
        _ => confidence_gap < AMBIGUITY_GAP,
    };

    Ok(MatchOutcome {
        candidates,
        needs_review,
        confidence_gap,
    })
}

/// Map bm25 scores (lower = better, already rank-ordered) onto the
/// confidence ladder. A hit whose score ties the one above it keeps that
/// hit's base confidence, so near-identical matches end up close enough
/// for the ambiguity gap to flag them; the linear decay still discounts
/// lower positions.
fn assign_confidences(scores: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(scores.len());
    let mut prev_base = 0.0;
    for (i, score) in scores.iter().enumerate() {
        let base = if i > 0 && (score - scores[i - 1]).abs() < SCORE_TIE_EPSILON {
            prev_base
        } else {
            FTS_CONFIDENCE[i.min(FTS_CONFIDENCE.len() - 1)]
        };
        prev_base = base;
        out.push(base * (1.0 - 0.1 * i as f64));
    }
    out
}

/// Persist the outcome as the event's candidate list (whole-list rewrite
/// so a reprocess never sees stale rows).
pub fn persist_candidates(store: &Store, event_id: &str, outcome: &MatchOutcome) -> Result<()> {
    let rows: Vec<EpicCandidate> = outcome
        .candidates
        .iter()
        .enumerate()
        .map(|(i, c)| EpicCandidate {
            event_id: event_id.to_string(),
            epic_id: c.epic_id.clone(),
            score: c.confidence,
            rank: (i + 1) as i64,
            match_type: c.match_kind.as_str().to_string(),
        })
        .collect();
    store.replace_candidates(event_id, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::EpicStatus;

    fn store_with_epics() -> (tempfile::TempDir, Store) {
        let (dir, store) = Store::open_temp().unwrap();
        store
            .create_epic("E1", "Payment Rails", Some("billing invoicing settlement"))
            .unwrap();
        store
            .create_epic("E2", "Search Revamp", Some("query ranking relevance"))
            .unwrap();
        (dir, store)
    }

    #[test]
    fn exact_alias_hit_wins_outright() {
        let (_dir, store) = store_with_epics();
        store.add_epic_alias("E1", "payments").unwrap();

        let outcome = match_epics(&store, "  Payments ").unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].epic_id, "E1");
        assert_eq!(outcome.candidates[0].confidence, 0.95);
        assert_eq!(outcome.candidates[0].match_kind, MatchKind::Exact);
        assert!(!outcome.needs_review);
    }

    #[test]
    fn archived_epic_alias_does_not_match() {
        let (_dir, store) = store_with_epics();
        store.add_epic_alias("E1", "payments").unwrap();
        store.set_epic_status("E1", EpicStatus::Archived).unwrap();

        let outcome = match_epics(&store, "payments").unwrap();
        // Falls through to FTS, which also excludes archived epics.
        assert!(outcome.candidates.iter().all(|c| c.epic_id != "E1"));
    }

    #[test]
    fn single_strong_fts_hit_skips_review() {
        let (_dir, store) = store_with_epics();
        let outcome = match_epics(&store, "invoicing").unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].epic_id, "E1");
        // First FTS position: 0.80 * (1 - 0.0) = 0.80, at the floor.
        assert!((outcome.candidates[0].confidence - 0.80).abs() < 1e-9);
        assert!(!outcome.needs_review);
    }

    #[test]
    fn ladder_decays_by_position_for_distinct_scores() {
        let conf = assign_confidences(&[-5.0, -3.0, -1.0]);
        assert!((conf[0] - 0.80).abs() < 1e-9);
        assert!((conf[1] - 0.60 * 0.9).abs() < 1e-9);
        assert!((conf[2] - 0.40 * 0.8).abs() < 1e-9);
        // 0.80 vs 0.54: unambiguous.
        assert!(conf[0] - conf[1] > AMBIGUITY_GAP);
    }

    #[test]
    fn tied_scores_collapse_the_gap() {
        let conf = assign_confidences(&[-4.0, -3.95]);
        assert!((conf[0] - 0.80).abs() < 1e-9);
        assert!((conf[1] - 0.80 * 0.9).abs() < 1e-9);
        assert!(conf[0] - conf[1] < AMBIGUITY_GAP);
    }

    #[test]
    fn near_identical_epics_need_review() {
        let (_dir, store) = Store::open_temp().unwrap();
        // Same token profile apart from the trailing word, so bm25
        // cannot separate them.
        store
            .create_epic("A", "Checkout Flow Alpha", Some("checkout funnel work"))
            .unwrap();
        store
            .create_epic("B", "Checkout Flow Beta", Some("checkout funnel work"))
            .unwrap();

        let outcome = match_epics(&store, "checkout funnel").unwrap();
        assert_eq!(outcome.candidates.len(), 2);
        assert!(outcome.confidence_gap < AMBIGUITY_GAP);
        assert!(outcome.needs_review);
    }

    #[test]
    fn no_candidates_needs_review() {
        let (_dir, store) = store_with_epics();
        let outcome = match_epics(&store, "completely unrelated topic").unwrap();
        assert!(outcome.candidates.is_empty());
        assert!(outcome.needs_review);
    }

    #[test]
    fn matcher_is_deterministic() {
        let (_dir, store) = store_with_epics();
        let a = match_epics(&store, "ranking relevance").unwrap();
        let b = match_epics(&store, "ranking relevance").unwrap();
        let ids_a: Vec<&str> = a.candidates.iter().map(|c| c.epic_id.as_str()).collect();
        let ids_b: Vec<&str> = b.candidates.iter().map(|c| c.epic_id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.needs_review, b.needs_review);
    }

    #[test]
    fn candidates_persist_with_ranks() {
        let (_dir, store) = store_with_epics();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();
        let outcome = match_epics(&store, "invoicing").unwrap();
        persist_candidates(&store, "ev", &outcome).unwrap();

        let rows = store.candidates_for_event("ev").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[0].epic_id, "E1");
    }
}
