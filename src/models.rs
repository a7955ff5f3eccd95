use crate::schema::{projects, tasks, time_entries};
use crate::timefmt::{format_hh_mm, format_hh_mm_ss};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// --- Helpers for deserializing PATCH-style nullable fields ---
// JSON null must become Some(None) (set column to NULL), while an absent key
// stays None (leave column untouched).

fn deserialize_opt_opt_string<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer) {
        Ok(Some(s)) => Ok(Some(Some(s))),
        Ok(None) => Ok(Some(None)),
        Err(e) => Err(e),
    }
}

// --- Task status ---

/// Workflow status of a task. The timer promotes `Todo` to `InProgress` on
/// first start and never regresses a status; `Done` is only ever set through
/// task updates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<TaskStatus> {
        match value {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

// --- Project Model ---
#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = projects)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug)]
#[diesel(table_name = projects)]
pub struct NewProject {
    pub title: String,
    pub description: Option<String>,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = projects)]
pub struct UpdateProjectChangeset {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Project as returned by the API, including the aggregates derived from its
/// tasks (count, total estimated/spent formatted as "HH:MM").
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProjectApiResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub task_count: i64,
    pub total_estimated_time: String,
    pub total_spent_time: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectApiResponse {
    pub fn from_parts(
        project: Project,
        task_count: i64,
        estimated_seconds_sum: i64,
        spent_seconds_sum: i64,
    ) -> Self {
        ProjectApiResponse {
            id: project.id,
            title: project.title,
            description: project.description,
            task_count,
            total_estimated_time: format_hh_mm(Some(estimated_seconds_sum)),
            total_spent_time: format_hh_mm(Some(spent_seconds_sum)),
            created_at: project.created_at,
            updated_at: project.updated_at,
        }
    }
}

// --- Task Model ---
#[derive(
    Queryable, Selectable, Identifiable, Associations, Deserialize, Debug, Clone, PartialEq,
)]
#[diesel(table_name = tasks)]
#[diesel(belongs_to(Project, foreign_key = project_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub estimated_seconds: i32,
    pub spent_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug)]
#[diesel(table_name = tasks)]
pub struct NewTask {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub estimated_seconds: Option<i32>,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = tasks)]
pub struct UpdateTaskChangeset {
    pub project_id: Option<Uuid>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<String>,
    pub estimated_seconds: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Task as returned by the API: raw second counts plus their "HH:MM"
/// renderings, and the derived timer fields.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskApiResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub estimated_seconds: i32,
    pub spent_seconds: i32,
    pub estimated_time: String,
    pub spent_time: String,
    pub has_active_timer: bool,
    pub active_timer: Option<TimeEntryApiResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskApiResponse {
    fn from(task_db: Task) -> Self {
        TaskApiResponse {
            id: task_db.id,
            project_id: task_db.project_id,
            title: task_db.title,
            description: task_db.description,
            status: task_db.status,
            estimated_seconds: task_db.estimated_seconds,
            spent_seconds: task_db.spent_seconds,
            estimated_time: format_hh_mm(Some(task_db.estimated_seconds as i64)),
            spent_time: format_hh_mm(Some(task_db.spent_seconds as i64)),
            // Populated by the handler once the open entry has been looked up.
            has_active_timer: false,
            active_timer: None,
            created_at: task_db.created_at,
            updated_at: task_db.updated_at,
        }
    }
}

// --- TimeEntry Model ---
#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Associations,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
)]
#[diesel(table_name = time_entries)]
#[diesel(belongs_to(Task))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TimeEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug)]
#[diesel(table_name = time_entries)]
pub struct NewTimeEntry {
    pub task_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = time_entries)]
pub struct CloseTimeEntryChangeset {
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeEntryApiResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// "HH:MM:SS" once the entry is closed, null while it is running.
    pub duration: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<TimeEntry> for TimeEntryApiResponse {
    fn from(entry: TimeEntry) -> Self {
        TimeEntryApiResponse {
            id: entry.id,
            task_id: entry.task_id,
            start_time: entry.start_time,
            is_active: entry.end_time.is_none(),
            duration: entry
                .duration_seconds
                .map(|secs| format_hh_mm_ss(secs as i64)),
            end_time: entry.end_time,
            created_at: entry.created_at,
        }
    }
}

// --- PAYLOAD DTOs ---

#[derive(Deserialize, Debug)]
pub struct CreateProjectPayload {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct UpdateProjectPayload {
    pub title: Option<String>,
    #[serde(deserialize_with = "deserialize_opt_opt_string", default)]
    pub description: Option<Option<String>>,
}

#[derive(Deserialize, Debug)]
pub struct CreateTaskPayload {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub estimated_seconds: Option<i32>,
}

#[derive(Deserialize, Debug)]
pub struct UpdateTaskPayload {
    pub project_id: Option<Uuid>,
    pub title: Option<String>,
    #[serde(deserialize_with = "deserialize_opt_opt_string", default)]
    pub description: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub estimated_seconds: Option<i32>,
}

// --- Pagination & search helpers ---

// Upper bounds keep `(page - 1) * per_page` well inside i64.
pub const MAX_PAGE: i64 = 1_000_000;
pub const MAX_PER_PAGE: i64 = 100;

/// Clamps pagination inputs to their bounds and derives the row offset.
pub fn sanitize_pagination(page: i64, per_page: i64) -> (i64, i64, i64) {
    let page = page.clamp(1, MAX_PAGE);
    let per_page = per_page.clamp(1, MAX_PER_PAGE);
    (page, per_page, (page - 1) * per_page)
}

/// ILIKE pattern matching the term anywhere in a column, with wildcard
/// characters in the raw term escaped.
pub fn search_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[derive(Serialize, Debug)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total_items: i64,
    pub total_pages: i64,
    pub page: i64,
    pub per_page: i64,
}

// --- Dashboard DTOs ---

/// Per-project spent-time row produced by the raw aggregate queries.
#[derive(QueryableByName, Debug, Clone)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProjectSpentRow {
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    pub project_id: Uuid,
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub project_title: String,
    // SUM over Int4 comes back as BigInt.
    #[diesel(sql_type = BigInt)]
    pub total_seconds: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProjectTimeSpent {
    pub project_id: Uuid,
    pub project_title: String,
    pub spent_time: String,
}

impl From<ProjectSpentRow> for ProjectTimeSpent {
    fn from(row: ProjectSpentRow) -> Self {
        ProjectTimeSpent {
            project_id: row.project_id,
            project_title: row.project_title,
            spent_time: format_hh_mm(Some(row.total_seconds)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DateRangeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DashboardResponse {
    /// One key per known status, zero-filled.
    pub task_counts: std::collections::BTreeMap<String, i64>,
    pub total_estimated_time: String,
    pub total_spent_time: String,
    pub time_spent_per_project: Vec<ProjectTimeSpent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range_filter: Option<DateRangeFilter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    #[test]
    fn task_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(parsed, TaskStatus::Done);
    }

    #[test]
    fn update_payload_distinguishes_null_from_absent() {
        let with_null: UpdateTaskPayload =
            serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(with_null.description, Some(None));

        let absent: UpdateTaskPayload = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(absent.description, None);

        let set: UpdateTaskPayload =
            serde_json::from_str(r#"{"description": "write docs"}"#).unwrap();
        assert_eq!(set.description, Some(Some("write docs".to_string())));
    }

    #[test]
    fn time_entry_response_reports_active_state() {
        let now = Utc::now();
        let open = TimeEntry {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
        };
        let api = TimeEntryApiResponse::from(open.clone());
        assert!(api.is_active);
        assert_eq!(api.duration, None);

        let closed = TimeEntry {
            end_time: Some(now + chrono::Duration::hours(1)),
            duration_seconds: Some(3600),
            ..open
        };
        let api = TimeEntryApiResponse::from(closed);
        assert!(!api.is_active);
        assert_eq!(api.duration.as_deref(), Some("01:00:00"));
    }

    #[test]
    fn pagination_is_clamped_against_overflow() {
        assert_eq!(sanitize_pagination(1, 10), (1, 10, 0));
        assert_eq!(sanitize_pagination(0, 0), (1, 1, 0));
        assert_eq!(sanitize_pagination(3, 25), (3, 25, 50));

        // An absurd page value must not overflow the offset computation.
        let (page, per_page, offset) = sanitize_pagination(i64::MAX, i64::MAX);
        assert_eq!(page, MAX_PAGE);
        assert_eq!(per_page, MAX_PER_PAGE);
        assert_eq!(offset, (MAX_PAGE - 1) * MAX_PER_PAGE);
    }

    #[test]
    fn search_patterns_escape_wildcards() {
        assert_eq!(search_pattern("api"), "%api%");
        assert_eq!(search_pattern("50%"), "%50\\%%");
        assert_eq!(search_pattern("a_b"), "%a\\_b%");
        assert_eq!(search_pattern("c:\\dir"), "%c:\\\\dir%");
    }

    #[test]
    fn date_range_filter_omits_absent_bounds() {
        let filter = DateRangeFilter {
            start_date: Some("2025-08-01".to_string()),
            end_date: None,
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"start_date": "2025-08-01"}));
    }
}
