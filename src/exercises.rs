//! Exercise database: the pass-through proxy to wger and the normalised
//! catalog the student dashboard renders.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Query, RawQuery, State},
    http::StatusCode,
};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::{Client, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::app::AppState;
use crate::error::AppError;

/// Exercises requested per page.
pub const PAGE_SIZE: usize = 20;

/// Upper bound for the cumulative "load more" count.
pub const MAX_COUNT: usize = 400;

const SPANISH: i64 = 6;
const ENGLISH: i64 = 2;

lazy_static! {
    static ref TAGS: Regex = Regex::new(r"<[^>]+>").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MuscleGroup {
    pub id: &'static str,
    pub label: &'static str,
    pub category: Option<u32>,
}

/// Browser filter chips and the wger category each one maps to.
pub const MUSCLE_GROUPS: [MuscleGroup; 9] = [
    MuscleGroup { id: "", label: "All", category: None },
    MuscleGroup { id: "chest", label: "Chest", category: Some(11) },
    MuscleGroup { id: "back", label: "Back", category: Some(12) },
    MuscleGroup { id: "shoulders", label: "Shoulders", category: Some(13) },
    MuscleGroup { id: "arms", label: "Arms", category: Some(8) },
    MuscleGroup { id: "legs", label: "Legs", category: Some(10) },
    MuscleGroup { id: "abs", label: "Core / Abs", category: Some(10) },
    MuscleGroup { id: "glutes", label: "Glutes", category: Some(14) },
    MuscleGroup { id: "cardio", label: "Cardio", category: Some(15) },
];

/// Unknown ids fall back to "All".
pub fn muscle_group(id: &str) -> MuscleGroup {
    MUSCLE_GROUPS
        .iter()
        .find(|group| group.id == id)
        .copied()
        .unwrap_or(MUSCLE_GROUPS[0])
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("exercise database answered {0}")]
    Status(StatusCode),

    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

/// HTTP client for the public exercise API.
pub struct ExerciseClient {
    client: Client,
    base_url: String,
}

impl ExerciseClient {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent("gymdesk/0.1")
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn upstream_url(&self, query: &str) -> String {
        format!("{}/api/v2/exerciseinfo/?{query}", self.base_url)
    }

    /// Fetches one page of `exerciseinfo` with the query passed through as is.
    pub async fn fetch(&self, query: &str) -> Result<Value, ProxyError> {
        let url = self.upstream_url(query);
        debug!("GET {url}");

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProxyError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// A normalised, searched page of exercises, or the offline list when
    /// the upstream cannot be reached.
    #[tracing::instrument(skip_all, fields(group = request.group.as_deref()))]
    pub async fn browse(&self, request: &CatalogRequest) -> CatalogPage {
        let group = muscle_group(request.group.as_deref().unwrap_or(""));
        let count = request.count.unwrap_or(PAGE_SIZE).clamp(PAGE_SIZE, MAX_COUNT);
        let search = request.search.as_deref().unwrap_or("").trim().to_string();

        let mut query = format!("format=json&limit={count}&offset=0");
        if let Some(category) = group.category {
            query.push_str(&format!("&category={category}"));
        }

        let (exercises, upstream_has_more, offline) = match self.fetch(&query).await {
            Ok(body) => {
                let results = body
                    .get("results")
                    .and_then(Value::as_array)
                    .map(|results| results.iter().filter_map(normalize).collect())
                    .unwrap_or_default();
                let has_next = body.get("next").is_some_and(Value::is_string);
                (results, has_next, false)
            }
            Err(e) => {
                warn!("Exercise database unavailable, using offline list: {e}");
                (fallback_exercises(group.category), false, true)
            }
        };

        let exercises = search_exercises(exercises, &search);
        CatalogPage {
            group: group.id,
            group_label: group.label,
            shown: exercises.len(),
            exercises,
            has_more: upstream_has_more && search.is_empty(),
            next_count: count + PAGE_SIZE,
            offline,
            search,
        }
    }
}

/// Rewrites a wger pagination link to point at this server's proxy.
pub fn rebase_page_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if !pairs.iter().any(|(key, _)| key == "format") {
        pairs.push(("format".to_string(), "json".to_string()));
    }

    let query = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    Some(format!("/api/exercises?{query}"))
}

pub fn rewrite_pagination(body: &mut Value) {
    for key in ["next", "previous"] {
        if let Some(slot) = body.get_mut(key) {
            if let Some(link) = slot.as_str() {
                *slot = rebase_page_link(link).map(Value::String).unwrap_or(Value::Null);
            }
        }
    }
}

/// `GET /api/exercises`: forwards the query string to wger.
pub async fn proxy_exercises(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, AppError> {
    let mut body = state
        .exercises
        .fetch(query.as_deref().unwrap_or(""))
        .await
        .map_err(|e| match e {
            ProxyError::Status(status) => AppError::Upstream {
                status,
                message: "Error connecting to the exercise database".into(),
            },
            ProxyError::Transport(e) => AppError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: e.to_string(),
            },
        })?;

    rewrite_pagination(&mut body);
    Ok(Json(body))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exercise {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub category_id: Option<u32>,
    pub muscles: String,
    pub muscles_secondary: String,
    pub equipment: String,
    pub is_spanish: bool,
}

/// HTML stripped of tags with the common entities decoded.
pub fn clean_description(html: &str) -> String {
    TAGS.replace_all(html, "")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

/// Joins a list of strings or `{name_en|name}` objects.
fn names(list: Option<&Value>) -> String {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(name.as_str()),
                    Value::Object(object) => object
                        .get("name_en")
                        .and_then(Value::as_str)
                        .filter(|name| !name.is_empty())
                        .or_else(|| object.get("name").and_then(Value::as_str)),
                    _ => None,
                })
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Picks the Spanish translation, then English, then whatever comes first.
/// Entries without a usable name are dropped.
pub fn normalize(raw: &Value) -> Option<Exercise> {
    let translations = raw.get("translations").and_then(Value::as_array)?;
    let in_language = |language: i64| {
        translations
            .iter()
            .find(|t| t.get("language").and_then(Value::as_i64) == Some(language))
    };

    let spanish = in_language(SPANISH);
    let chosen = spanish
        .or_else(|| in_language(ENGLISH))
        .or_else(|| translations.first())?;
    let name = chosen
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())?;

    let id = raw
        .get("uuid")
        .or_else(|| raw.get("id"))
        .map(|id| match id {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    let category = raw.get("category");
    Some(Exercise {
        id,
        name: name.to_string(),
        description: clean_description(
            chosen.get("description").and_then(Value::as_str).unwrap_or(""),
        ),
        category: category
            .and_then(|c| c.get("name").and_then(Value::as_str).or_else(|| c.as_str()))
            .unwrap_or("")
            .to_string(),
        category_id: category
            .and_then(|c| c.get("id").or(Some(c)))
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok()),
        muscles: names(raw.get("muscles")),
        muscles_secondary: names(raw.get("muscles_secondary")),
        equipment: names(raw.get("equipment")),
        is_spanish: spanish.is_some(),
    })
}

pub fn search_exercises(exercises: Vec<Exercise>, search: &str) -> Vec<Exercise> {
    let needle = search.trim().to_lowercase();
    if needle.is_empty() {
        return exercises;
    }
    exercises
        .into_iter()
        .filter(|exercise| exercise.name.to_lowercase().contains(&needle))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn offline(
    id: &str,
    name: &str,
    category: &str,
    category_id: u32,
    muscles: &str,
    secondary: &str,
    equipment: &str,
    description: &str,
) -> Exercise {
    Exercise {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        category_id: Some(category_id),
        muscles: muscles.to_string(),
        muscles_secondary: secondary.to_string(),
        equipment: equipment.to_string(),
        is_spanish: false,
    }
}

/// Built-in list shown when the exercise database is unreachable,
/// restricted to `category` when one is selected.
pub fn fallback_exercises(category: Option<u32>) -> Vec<Exercise> {
    let all = vec![
        offline("f1", "Bench press", "Chest", 11, "Pectorals", "Triceps", "Barbell",
            "Lying on the bench, lower the bar to your chest and press it back up. Keep your feet on the floor and your glutes on the bench."),
        offline("f2", "Push-ups", "Chest", 11, "Pectorals", "Triceps", "No equipment",
            "In a plank with hands shoulder-width apart, lower your chest to the floor and push back up keeping your body straight."),
        offline("f3", "Pull-ups", "Back", 12, "Lats", "Biceps", "Pull-up bar",
            "Hanging from the bar with an overhand grip, drive your elbows down to bring your chin over the bar."),
        offline("f4", "Barbell row", "Back", 12, "Lats", "Biceps", "Barbell",
            "With your torso at 45 degrees, pull the bar to your stomach keeping your back straight and elbows close to the body."),
        offline("f5", "Deadlift", "Back", 12, "Erector spinae", "Glutes", "Barbell",
            "With the bar on the floor, bend down keeping a neutral spine and lift by extending hips and knees together."),
        offline("f6", "Overhead press", "Shoulders", 13, "Deltoids", "Triceps", "Barbell",
            "Standing, press the bar from your shoulders overhead until your arms are extended. Keep your core braced."),
        offline("f7", "Lateral raises", "Shoulders", 13, "Deltoids", "", "Dumbbells",
            "Standing with dumbbells at your sides, raise them to shoulder height with slightly bent elbows."),
        offline("f8", "Biceps curl", "Arms", 8, "Biceps", "", "Dumbbells",
            "Standing with dumbbells, bend your elbows bringing the weight towards your shoulders. Keep your elbows close to the body."),
        offline("f9", "Triceps extension", "Arms", 8, "Triceps", "", "Dumbbell",
            "With a dumbbell overhead, bend and extend the elbow keeping the upper arm vertical and the elbow pointing up."),
        offline("f10", "Squat", "Legs", 10, "Quadriceps", "Glutes", "Barbell",
            "Feet shoulder-width apart, bend knees and hips until your thighs are parallel to the floor. Keep your back straight."),
        offline("f11", "Lunges", "Legs", 10, "Quadriceps", "Glutes", "No equipment",
            "Take a long step forward, lower the back knee almost to the floor and return. Alternate legs."),
        offline("f12", "Plank", "Abs", 10, "Abs", "Glutes", "No equipment",
            "Resting on forearms and toes, hold your body straight as a board. Do not drop your hips or raise your glutes."),
        offline("f13", "Crunches", "Abs", 10, "Abs", "", "No equipment",
            "Lying on your back with bent knees, contract your abs lifting the shoulders off the floor. Lower under control."),
        offline("f14", "Calf raises", "Calves", 14, "Calves", "", "No equipment",
            "Standing, rise slowly onto your toes and lower under control. Can be done with or without weight."),
    ];

    all.into_iter()
        .filter(|exercise| category.is_none() || exercise.category_id == category)
        .collect()
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct CatalogRequest {
    pub group: Option<String>,
    pub count: Option<usize>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub group: &'static str,
    pub group_label: &'static str,
    pub exercises: Vec<Exercise>,
    pub shown: usize,
    pub has_more: bool,
    pub next_count: usize,
    pub offline: bool,
    pub search: String,
}

/// `GET /api/exercises/catalog`
pub async fn handle_catalog(
    State(state): State<Arc<AppState>>,
    Query(request): Query<CatalogRequest>,
) -> Json<CatalogPage> {
    Json(state.exercises.browse(&request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spanish_then_english_then_first() {
        let raw = json!({
            "uuid": "u1",
            "category": { "id": 11, "name": "Chest" },
            "translations": [
                { "language": 2, "name": "Bench press", "description": "<p>Push</p>" },
                { "language": 6, "name": "Press de banca", "description": "<p>Empujar &amp; bajar</p>" },
            ],
            "muscles": [{ "name": "Pectoralis major", "name_en": "Chest" }, "Front delts"],
            "muscles_secondary": [{ "name": "Triceps brachii", "name_en": "" }],
            "equipment": [{ "name": "Barbell" }, { "id": 3 }],
        });
        let exercise = normalize(&raw).unwrap();
        assert_eq!(exercise.name, "Press de banca");
        assert!(exercise.is_spanish);
        assert_eq!(exercise.description, "Empujar & bajar");
        assert_eq!(exercise.category, "Chest");
        assert_eq!(exercise.category_id, Some(11));
        assert_eq!(exercise.muscles, "Chest, Front delts");
        assert_eq!(exercise.muscles_secondary, "Triceps brachii");
        assert_eq!(exercise.equipment, "Barbell");

        let english = json!({ "id": 5, "translations": [
            { "language": 4, "name": "Other" },
            { "language": 2, "name": "Squat" },
        ]});
        let exercise = normalize(&english).unwrap();
        assert_eq!(exercise.name, "Squat");
        assert_eq!(exercise.id, "5");
        assert!(!exercise.is_spanish);

        let first = json!({ "id": 6, "translations": [{ "language": 4, "name": "Kniebeuge" }] });
        assert_eq!(normalize(&first).unwrap().name, "Kniebeuge");
    }

    #[test]
    fn nameless_or_untranslated_entries_are_dropped() {
        assert!(normalize(&json!({ "id": 1, "translations": [] })).is_none());
        assert!(normalize(&json!({ "id": 1 })).is_none());
        assert!(normalize(&json!({ "id": 1, "translations": [{ "language": 6, "name": "  " }] })).is_none());
    }

    #[test]
    fn descriptions_lose_markup() {
        assert_eq!(
            clean_description("<p>Keep&nbsp;the <b>bar</b> &lt;low&gt;</p>\n"),
            "Keep the bar <low>"
        );
    }

    #[test]
    fn page_links_point_back_at_the_proxy() {
        assert_eq!(
            rebase_page_link("https://wger.de/api/v2/exerciseinfo/?category=11&limit=20&offset=20").unwrap(),
            "/api/exercises?category=11&limit=20&offset=20&format=json"
        );
        assert_eq!(
            rebase_page_link("https://wger.de/api/v2/exerciseinfo/?format=json&offset=40").unwrap(),
            "/api/exercises?format=json&offset=40"
        );

        let mut body = json!({ "next": "https://wger.de/api/v2/exerciseinfo/?offset=20", "previous": null });
        rewrite_pagination(&mut body);
        assert_eq!(body["next"], "/api/exercises?offset=20&format=json");
        assert!(body["previous"].is_null());
    }

    #[test]
    fn fallback_filters_by_category() {
        assert_eq!(fallback_exercises(None).len(), 14);
        let legs = fallback_exercises(Some(10));
        assert_eq!(legs.len(), 4);
        assert!(legs.iter().all(|e| e.category_id == Some(10)));
        assert!(fallback_exercises(Some(15)).is_empty());
    }

    #[test]
    fn search_is_case_insensitive() {
        let found = search_exercises(fallback_exercises(None), "PRESS");
        let names: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Bench press", "Overhead press"]);
    }

    #[test]
    fn unknown_group_means_all() {
        assert_eq!(muscle_group("abs").category, Some(10));
        assert_eq!(muscle_group("nope").id, "");
    }

    #[tokio::test]
    async fn unreachable_database_serves_offline_list() {
        let client = ExerciseClient::new("http://127.0.0.1:9").unwrap();
        let page = client
            .browse(&CatalogRequest { group: Some("chest".into()), count: None, search: None })
            .await;
        assert!(page.offline);
        assert!(!page.has_more);
        assert_eq!(page.shown, 2);
        assert_eq!(page.next_count, PAGE_SIZE * 2);
    }
}
