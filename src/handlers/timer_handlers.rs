use crate::cache::{self, DashboardCache};
use crate::db::{self, DbPool};
use crate::error_handler::ServiceError;
use crate::models::{
    CloseTimeEntryChangeset, NewTimeEntry, TaskStatus, TimeEntry, TimeEntryApiResponse,
};
use actix_web::{post, web, HttpResponse};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use uuid::Uuid;

/// End minus start in whole seconds. Non-negative by construction (the end is
/// sampled after the entry was created), clamped anyway so a skewed clock can
/// never drive `spent_seconds` backwards.
fn elapsed_seconds(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> i32 {
    (end_time - start_time).num_seconds().max(0) as i32
}

/// Gate for start: a task with an open entry cannot start another timer.
fn ensure_no_active_timer(open_entries: i64) -> Result<(), ServiceError> {
    if open_entries > 0 {
        return Err(ServiceError::Conflict(
            "Task already has an active timer".to_string(),
        ));
    }
    Ok(())
}

/// Status promotion on start: only `todo` moves to `in_progress`; every other
/// status stays where it is.
fn promoted_status_on_start(current_status: &str) -> Option<&'static str> {
    if current_status == TaskStatus::Todo.as_str() {
        Some(TaskStatus::InProgress.as_str())
    } else {
        None
    }
}

/// Gate for stop: there must be an open entry to close.
fn require_active_entry(entry: Option<TimeEntry>) -> Result<TimeEntry, ServiceError> {
    entry.ok_or_else(|| {
        ServiceError::BadRequest("No active timer found for this task".to_string())
    })
}

fn evict_dashboard_caches(dashboard_cache: &DashboardCache, project_uuid: Uuid) {
    // Only the unparameterized dashboard key and the project's own key are
    // evicted; date-filtered dashboard entries age out via TTL.
    dashboard_cache.delete(&cache::dashboard_key(None, None));
    dashboard_cache.delete(&cache::project_metrics_key(project_uuid));
}

/// Starts time tracking for a task: creates an open entry and promotes a
/// `todo` task to `in_progress`. The whole check-then-act runs in one
/// transaction under a row lock on the task, so two concurrent starts for the
/// same task serialize and the loser sees the winner's open entry.
#[post("/{task_id_path}/start-timer")]
pub async fn start_timer_handler(
    pool: web::Data<DbPool>,
    dashboard_cache: web::Data<DashboardCache>,
    task_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::{tasks, time_entries};

    let timer_task_id = task_id_path.into_inner();

    let mut conn = pool.get().await?;

    let (entry, project_uuid) = conn
        .transaction::<(TimeEntry, Uuid), ServiceError, _>(|conn| {
            async move {
                let task = db::lock_task(conn, timer_task_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Task with id {} not found", timer_task_id))
                    })?;

                let open_entries = time_entries::table
                    .filter(time_entries::task_id.eq(timer_task_id))
                    .filter(time_entries::end_time.is_null())
                    .count()
                    .get_result::<i64>(conn)
                    .await
                    .map_err(ServiceError::from)?;

                ensure_no_active_timer(open_entries)?;

                let new_entry = NewTimeEntry {
                    task_id: timer_task_id,
                    start_time: Utc::now(),
                    end_time: None,
                    duration_seconds: None,
                };

                let entry = diesel::insert_into(time_entries::table)
                    .values(&new_entry)
                    .get_result::<TimeEntry>(conn)
                    .await
                    .map_err(|e| match e {
                        // The partial unique index backstops the check above.
                        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                            ServiceError::Conflict("Task already has an active timer".to_string())
                        }
                        other => ServiceError::from(other),
                    })?;

                if let Some(next_status) = promoted_status_on_start(&task.status) {
                    diesel::update(tasks::table.filter(tasks::id.eq(timer_task_id)))
                        .set((
                            tasks::status.eq(next_status),
                            tasks::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await
                        .map_err(ServiceError::from)?;
                }

                Ok((entry, task.project_id))
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| {
            if matches!(e, ServiceError::DatabaseError(_) | ServiceError::InternalServerError(_)) {
                log::error!("Error starting timer for task {}: {}", timer_task_id, e);
            }
            e
        })?;

    evict_dashboard_caches(&dashboard_cache, project_uuid);

    log::info!("Started timer {} for task {}", entry.id, timer_task_id);

    Ok(HttpResponse::Created().json(TimeEntryApiResponse::from(entry)))
}

/// Stops the task's open entry: stamps the end time, derives the duration and
/// folds it into the task's accumulated `spent_seconds`. Same row-lock
/// transaction shape as start.
#[post("/{task_id_path}/stop-timer")]
pub async fn stop_timer_handler(
    pool: web::Data<DbPool>,
    dashboard_cache: web::Data<DashboardCache>,
    task_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::{tasks, time_entries};

    let timer_task_id = task_id_path.into_inner();

    let mut conn = pool.get().await?;

    let (entry, project_uuid) = conn
        .transaction::<(TimeEntry, Uuid), ServiceError, _>(|conn| {
            async move {
                let task = db::lock_task(conn, timer_task_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Task with id {} not found", timer_task_id))
                    })?;

                let active_entry = require_active_entry(
                    time_entries::table
                        .filter(time_entries::task_id.eq(timer_task_id))
                        .filter(time_entries::end_time.is_null())
                        .select(TimeEntry::as_select())
                        .first::<TimeEntry>(conn)
                        .await
                        .optional()
                        .map_err(ServiceError::from)?,
                )?;

                let stopped_at = Utc::now();
                let duration_secs = elapsed_seconds(active_entry.start_time, stopped_at);

                let close_changes = CloseTimeEntryChangeset {
                    end_time: Some(stopped_at),
                    duration_seconds: Some(duration_secs),
                    updated_at: Some(stopped_at),
                };

                let closed_entry = diesel::update(
                    time_entries::table.filter(time_entries::id.eq(active_entry.id)),
                )
                .set(&close_changes)
                .get_result::<TimeEntry>(conn)
                .await
                .map_err(ServiceError::from)?;

                // Monotonic accumulation; stop_timer is the only writer.
                diesel::update(tasks::table.filter(tasks::id.eq(timer_task_id)))
                    .set((
                        tasks::spent_seconds.eq(tasks::spent_seconds + duration_secs),
                        tasks::updated_at.eq(stopped_at),
                    ))
                    .execute(conn)
                    .await
                    .map_err(ServiceError::from)?;

                Ok((closed_entry, task.project_id))
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| {
            if matches!(e, ServiceError::DatabaseError(_) | ServiceError::InternalServerError(_)) {
                log::error!("Error stopping timer for task {}: {}", timer_task_id, e);
            }
            e
        })?;

    evict_dashboard_caches(&dashboard_cache, project_uuid);

    log::info!(
        "Stopped timer {} for task {} after {}s",
        entry.id,
        timer_task_id,
        entry.duration_seconds.unwrap_or(0)
    );

    Ok(HttpResponse::Ok().json(TimeEntryApiResponse::from(entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::ResponseError;
    use chrono::Duration;

    fn open_entry() -> TimeEntry {
        let now = Utc::now();
        TimeEntry {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn start_is_rejected_while_a_timer_is_open() {
        assert!(ensure_no_active_timer(0).is_ok());

        let err = ensure_no_active_timer(1).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stop_requires_an_open_entry() {
        let err = require_active_entry(None).unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let entry = open_entry();
        let passed = require_active_entry(Some(entry.clone())).unwrap();
        assert_eq!(passed, entry);
    }

    #[test]
    fn only_todo_tasks_are_promoted_on_start() {
        assert_eq!(promoted_status_on_start("todo"), Some("in_progress"));
        // Never regressed or re-promoted from any other status.
        assert_eq!(promoted_status_on_start("in_progress"), None);
        assert_eq!(promoted_status_on_start("done"), None);
    }

    #[test]
    fn elapsed_seconds_matches_end_minus_start() {
        let start = Utc::now();
        assert_eq!(elapsed_seconds(start, start + Duration::hours(1)), 3600);
        assert_eq!(elapsed_seconds(start, start + Duration::seconds(90)), 90);
        assert_eq!(elapsed_seconds(start, start), 0);
    }

    #[test]
    fn elapsed_seconds_never_negative() {
        let start = Utc::now();
        assert_eq!(elapsed_seconds(start, start - Duration::seconds(5)), 0);
    }

    #[test]
    fn eviction_targets_only_unfiltered_keys() {
        let cache_handle = DashboardCache::new(std::time::Duration::from_secs(60));
        let project_uuid = Uuid::new_v4();
        let filtered_key = cache::dashboard_key(
            chrono::NaiveDate::from_ymd_opt(2025, 8, 1),
            chrono::NaiveDate::from_ymd_opt(2025, 8, 30),
        );

        cache_handle.set(&cache::dashboard_key(None, None), serde_json::json!(1));
        cache_handle.set(&cache::project_metrics_key(project_uuid), serde_json::json!(2));
        cache_handle.set(&filtered_key, serde_json::json!(3));

        evict_dashboard_caches(&cache_handle, project_uuid);

        assert_eq!(cache_handle.get(&cache::dashboard_key(None, None)), None);
        assert_eq!(cache_handle.get(&cache::project_metrics_key(project_uuid)), None);
        // Range-filtered entries survive until TTL expiry.
        assert_eq!(cache_handle.get(&filtered_key), Some(serde_json::json!(3)));
    }
}
