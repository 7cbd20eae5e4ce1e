// Search endpoint - ranked FTS over actions, knowledge and epics

use super::ApiError;
use crate::server::AppState;
use crate::store::SearchHit;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
    /// Restrict hits to projections of one epic.
    pub epic_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
}

/// GET /api/search?q=&limit=&epic_id=
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    let limit = query.limit.unwrap_or(20).min(100);
    let mut results = state.store.search(&query.q, limit)?;

    if let Some(epic_id) = &query.epic_id {
        let actions: HashSet<String> =
            state.store.action_ids_for_epic(epic_id)?.into_iter().collect();
        let knowledge: HashSet<String> = state
            .store
            .knowledge_ids_for_epic(epic_id)?
            .into_iter()
            .collect();
        scope_to_epic(&mut results, epic_id, &actions, &knowledge);
    }

    Ok(Json(SearchResponse {
        query: query.q,
        results,
    }))
}

/// Keep only hits whose source row belongs to the epic: the epic's own
/// row, its actions, and its knowledge items. Anything else is dropped
/// rather than leaked.
fn scope_to_epic(
    results: &mut Vec<SearchHit>,
    epic_id: &str,
    action_ids: &HashSet<String>,
    knowledge_ids: &HashSet<String>,
) {
    results.retain(|hit| match hit.content_type.as_str() {
        "epic" => hit.content_id == epic_id,
        "action" => action_ids.contains(&hit.content_id),
        "knowledge" => knowledge_ids.contains(&hit.content_id),
        _ => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content_type: &str, content_id: &str) -> SearchHit {
        SearchHit {
            content_type: content_type.to_string(),
            content_id: content_id.to_string(),
            title: String::new(),
            content: String::new(),
            rank: -1.0,
        }
    }

    #[test]
    fn scoping_drops_other_epics_rows_of_every_kind() {
        let mut results = vec![
            hit("epic", "E1"),
            hit("epic", "E2"),
            hit("action", "a-mine"),
            hit("action", "a-other"),
            hit("knowledge", "k-mine"),
            hit("knowledge", "k-other"),
        ];
        let actions: HashSet<String> = ["a-mine".to_string()].into();
        let knowledge: HashSet<String> = ["k-mine".to_string()].into();

        scope_to_epic(&mut results, "E1", &actions, &knowledge);

        let ids: Vec<&str> = results.iter().map(|h| h.content_id.as_str()).collect();
        assert_eq!(ids, vec!["E1", "a-mine", "k-mine"]);
    }

    #[test]
    fn scoping_with_empty_sets_keeps_only_the_epic_row() {
        let mut results = vec![
            hit("epic", "E1"),
            hit("action", "a1"),
            hit("knowledge", "k1"),
        ];
        scope_to_epic(&mut results, "E1", &HashSet::new(), &HashSet::new());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content_type, "epic");
    }
}
