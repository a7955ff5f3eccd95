use crate::cache::{self, DashboardCache};
use crate::db::DbPool;
use crate::error_handler::ServiceError;
use crate::models::{
    sanitize_pagination, search_pattern, CreateTaskPayload, NewTask, PaginatedResponse, Task,
    TaskApiResponse, TaskStatus, TimeEntry, TimeEntryApiResponse, UpdateTaskChangeset,
    UpdateTaskPayload,
};
use actix_web::{delete, get, post, put, web, HttpResponse};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
pub struct TaskQueryParams {
    pub project_id: Option<Uuid>,
    pub status: Option<String>,
    /// Case-insensitive match anywhere in title or description.
    pub search: Option<String>,
    pub has_active_timer: Option<bool>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

async fn project_exists(
    conn: &mut AsyncPgConnection,
    project_uuid: Uuid,
) -> Result<bool, ServiceError> {
    use crate::schema::projects;

    let found = projects::table
        .filter(projects::id.eq(project_uuid))
        .count()
        .get_result::<i64>(conn)
        .await
        .map_err(ServiceError::from)?;

    Ok(found > 0)
}

/// Builds the API view of a task, looking up its open time entry (at most one
/// exists, enforced by the partial unique index).
async fn attach_active_timer(
    conn: &mut AsyncPgConnection,
    task: Task,
) -> Result<TaskApiResponse, ServiceError> {
    use crate::schema::time_entries;

    let open_entry = time_entries::table
        .filter(time_entries::task_id.eq(task.id))
        .filter(time_entries::end_time.is_null())
        .select(TimeEntry::as_select())
        .first::<TimeEntry>(conn)
        .await
        .optional()
        .map_err(ServiceError::from)?;

    let mut response = TaskApiResponse::from(task);
    response.has_active_timer = open_entry.is_some();
    response.active_timer = open_entry.map(TimeEntryApiResponse::from);

    Ok(response)
}

fn validate_estimated_seconds(value: Option<i32>) -> Result<(), ServiceError> {
    match value {
        Some(secs) if secs < 0 => Err(ServiceError::BadRequest(
            "estimated_seconds must be non-negative".to_string(),
        )),
        _ => Ok(()),
    }
}

#[post("")]
pub async fn create_task_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    payload: web::Json<CreateTaskPayload>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::tasks;

    validate_estimated_seconds(payload.estimated_seconds)?;

    let mut conn = pool.get().await?;

    if !project_exists(&mut conn, payload.project_id).await? {
        return Err(ServiceError::NotFound(format!(
            "Project with id {} not found",
            payload.project_id
        )));
    }

    let new_task_data = NewTask {
        project_id: payload.project_id,
        title: payload.title.clone(),
        description: payload.description.clone(),
        status: payload.status.map(|s| s.as_str().to_string()),
        estimated_seconds: payload.estimated_seconds,
    };

    let task = diesel::insert_into(tasks::table)
        .values(&new_task_data)
        .get_result::<Task>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    // The project's cached metrics now undercount its tasks.
    project_cache.delete(&cache::project_metrics_key(task.project_id));

    // A fresh task cannot have an open entry.
    let task_response = TaskApiResponse::from(task);

    Ok(HttpResponse::Created().json(task_response))
}

#[get("")]
pub async fn list_tasks_handler(
    pool: web::Data<DbPool>,
    query: web::Query<TaskQueryParams>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::{tasks, time_entries};

    let (page, per_page, offset) =
        sanitize_pagination(query.page.unwrap_or(1), query.per_page.unwrap_or(10));

    // Reject unknown statuses up front rather than silently matching nothing.
    let status_filter = match &query.status {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            ServiceError::BadRequest(format!(
                "Invalid status filter '{}'. Supported: todo, in_progress, done",
                raw
            ))
        })?),
        None => None,
    };

    let mut conn = pool.get().await?;

    let mut count_query = tasks::table.into_boxed();
    let mut query_builder = tasks::table.into_boxed();

    if let Some(project_uuid) = query.project_id {
        query_builder = query_builder.filter(tasks::project_id.eq(project_uuid));
        count_query = count_query.filter(tasks::project_id.eq(project_uuid));
    }

    if let Some(task_status) = status_filter {
        query_builder = query_builder.filter(tasks::status.eq(task_status.as_str()));
        count_query = count_query.filter(tasks::status.eq(task_status.as_str()));
    }

    if let Some(search_term) = &query.search {
        let pattern = search_pattern(search_term);
        query_builder = query_builder.filter(
            tasks::title
                .ilike(pattern.clone())
                .or(tasks::description.ilike(pattern.clone())),
        );
        count_query = count_query.filter(
            tasks::title
                .ilike(pattern.clone())
                .or(tasks::description.ilike(pattern)),
        );
    }

    if let Some(wants_active) = query.has_active_timer {
        if wants_active {
            query_builder = query_builder.filter(
                tasks::id.eq_any(
                    time_entries::table
                        .filter(time_entries::end_time.is_null())
                        .select(time_entries::task_id),
                ),
            );
            count_query = count_query.filter(
                tasks::id.eq_any(
                    time_entries::table
                        .filter(time_entries::end_time.is_null())
                        .select(time_entries::task_id),
                ),
            );
        } else {
            query_builder = query_builder.filter(
                tasks::id.ne_all(
                    time_entries::table
                        .filter(time_entries::end_time.is_null())
                        .select(time_entries::task_id),
                ),
            );
            count_query = count_query.filter(
                tasks::id.ne_all(
                    time_entries::table
                        .filter(time_entries::end_time.is_null())
                        .select(time_entries::task_id),
                ),
            );
        }
    }

    let total_items = count_query
        .count()
        .get_result::<i64>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    let task_list = query_builder
        .order(tasks::created_at.desc())
        .limit(per_page)
        .offset(offset)
        .select(Task::as_select())
        .load::<Task>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    let mut task_responses = Vec::new();

    for task in task_list {
        task_responses.push(attach_active_timer(&mut conn, task).await?);
    }

    let total_pages = (total_items + per_page - 1) / per_page;

    let paginated_response = PaginatedResponse {
        items: task_responses,
        total_items,
        total_pages,
        page,
        per_page,
    };

    Ok(HttpResponse::Ok().json(paginated_response))
}

#[get("/{task_id_path}")]
pub async fn get_task_handler(
    pool: web::Data<DbPool>,
    task_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::tasks;

    let task_to_find_id = task_id_path.into_inner();

    let mut conn = pool.get().await?;

    let task_option = tasks::table
        .filter(tasks::id.eq(task_to_find_id))
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .await
        .optional()
        .map_err(ServiceError::from)?;

    match task_option {
        Some(task) => {
            let task_response = attach_active_timer(&mut conn, task).await?;
            Ok(HttpResponse::Ok().json(task_response))
        }
        None => Err(ServiceError::NotFound(format!(
            "Task with id {} not found",
            task_to_find_id
        ))),
    }
}

#[put("/{task_id_path}")]
pub async fn update_task_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    task_id_path: web::Path<Uuid>,
    payload: web::Json<UpdateTaskPayload>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::tasks;

    let task_to_update_id = task_id_path.into_inner();

    validate_estimated_seconds(payload.estimated_seconds)?;

    let mut conn = pool.get().await?;

    if let Some(new_project_id) = payload.project_id {
        if !project_exists(&mut conn, new_project_id).await? {
            return Err(ServiceError::NotFound(format!(
                "Project with id {} not found",
                new_project_id
            )));
        }
    }

    let task_changes = UpdateTaskChangeset {
        project_id: payload.project_id,
        title: payload.title.clone(),
        description: payload.description.clone(),
        status: payload.status.map(|s| s.as_str().to_string()),
        estimated_seconds: payload.estimated_seconds,
        updated_at: Some(Utc::now()),
    };

    let updated_task = diesel::update(tasks::table.filter(tasks::id.eq(task_to_update_id)))
        .set(&task_changes)
        .get_result::<Task>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    project_cache.delete(&cache::project_metrics_key(updated_task.project_id));

    let task_response = attach_active_timer(&mut conn, updated_task).await?;

    Ok(HttpResponse::Ok().json(task_response))
}

#[delete("/{task_id_path}")]
pub async fn delete_task_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    task_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::tasks;

    let task_to_delete_id = task_id_path.into_inner();

    let mut conn = pool.get().await?;

    // Time entries cascade with the task.
    let deleted_task = diesel::delete(tasks::table.filter(tasks::id.eq(task_to_delete_id)))
        .get_result::<Task>(&mut conn)
        .await
        .optional()
        .map_err(ServiceError::from)?;

    match deleted_task {
        Some(task) => {
            project_cache.delete(&cache::project_metrics_key(task.project_id));

            Ok(HttpResponse::Ok().json(json!({
                "status": "success",
                "message": format!("Task with id {} deleted successfully", task_to_delete_id)
            })))
        }
        None => Err(ServiceError::NotFound(format!(
            "Task with id {} not found to delete",
            task_to_delete_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_estimates_are_rejected() {
        assert!(validate_estimated_seconds(Some(-1)).is_err());
        assert!(validate_estimated_seconds(Some(0)).is_ok());
        assert!(validate_estimated_seconds(Some(7200)).is_ok());
        assert!(validate_estimated_seconds(None).is_ok());
    }

    #[test]
    fn query_params_accept_partial_filters() {
        let query: TaskQueryParams =
            serde_json::from_str(r#"{"status": "in_progress", "page": 2}"#).unwrap();
        assert_eq!(query.status.as_deref(), Some("in_progress"));
        assert_eq!(query.page, Some(2));
        assert_eq!(query.project_id, None);
        assert_eq!(query.search, None);
        assert_eq!(query.has_active_timer, None);
    }

    #[test]
    fn query_params_accept_search_and_timer_filters() {
        let query: TaskQueryParams =
            serde_json::from_str(r#"{"search": "backend", "has_active_timer": true}"#).unwrap();
        assert_eq!(query.search.as_deref(), Some("backend"));
        assert_eq!(query.has_active_timer, Some(true));
    }
}
