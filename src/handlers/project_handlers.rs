use crate::cache::{self, DashboardCache};
use crate::db::DbPool;
use crate::error_handler::ServiceError;
use crate::models::{
    sanitize_pagination, search_pattern, CreateProjectPayload, NewProject, PaginatedResponse,
    Project, ProjectApiResponse, UpdateProjectChangeset, UpdateProjectPayload,
};
use actix_web::{delete, get, post, put, web, HttpResponse};
use chrono::Utc;
use diesel::dsl::{count_star, sum};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
pub struct ProjectQueryParams {
    /// Case-insensitive match anywhere in title or description.
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Task aggregates for one project: (task_count, estimated sum, spent sum).
async fn load_project_totals(
    conn: &mut AsyncPgConnection,
    project_uuid: Uuid,
) -> Result<(i64, i64, i64), ServiceError> {
    use crate::schema::tasks;

    let (task_count, estimated_sum, spent_sum) = tasks::table
        .filter(tasks::project_id.eq(project_uuid))
        .select((
            count_star(),
            sum(tasks::estimated_seconds),
            sum(tasks::spent_seconds),
        ))
        .first::<(i64, Option<i64>, Option<i64>)>(conn)
        .await
        .map_err(ServiceError::from)?;

    Ok((
        task_count,
        estimated_sum.unwrap_or(0),
        spent_sum.unwrap_or(0),
    ))
}

#[post("")]
pub async fn create_project_handler(
    pool: web::Data<DbPool>,
    payload: web::Json<CreateProjectPayload>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::projects;

    let new_project_data = NewProject {
        title: payload.title.clone(),
        description: payload.description.clone(),
    };

    let mut conn = pool.get().await?;

    let project = diesel::insert_into(projects::table)
        .values(&new_project_data)
        .get_result::<Project>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    // A fresh project has no tasks yet.
    let response = ProjectApiResponse::from_parts(project, 0, 0, 0);

    Ok(HttpResponse::Created().json(response))
}

#[get("")]
pub async fn list_projects_handler(
    pool: web::Data<DbPool>,
    query: web::Query<ProjectQueryParams>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::projects;

    let (page, per_page, offset) =
        sanitize_pagination(query.page.unwrap_or(1), query.per_page.unwrap_or(10));

    let mut conn = pool.get().await?;

    let mut count_query = projects::table.into_boxed();
    let mut query_builder = projects::table.into_boxed();

    if let Some(search_term) = &query.search {
        let pattern = search_pattern(search_term);
        query_builder = query_builder.filter(
            projects::title
                .ilike(pattern.clone())
                .or(projects::description.ilike(pattern.clone())),
        );
        count_query = count_query.filter(
            projects::title
                .ilike(pattern.clone())
                .or(projects::description.ilike(pattern)),
        );
    }

    let total_items = count_query
        .count()
        .get_result::<i64>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    let project_list = query_builder
        .order(projects::created_at.desc())
        .limit(per_page)
        .offset(offset)
        .select(Project::as_select())
        .load::<Project>(&mut conn)
        .await
        .map_err(ServiceError::from)?;

    let mut project_responses = Vec::new();

    for project in project_list {
        let (task_count, estimated_sum, spent_sum) =
            load_project_totals(&mut conn, project.id).await?;
        project_responses.push(ProjectApiResponse::from_parts(
            project,
            task_count,
            estimated_sum,
            spent_sum,
        ));
    }

    let total_pages = (total_items + per_page - 1) / per_page;

    let paginated_response = PaginatedResponse {
        items: project_responses,
        total_items,
        total_pages,
        page,
        per_page,
    };

    Ok(HttpResponse::Ok().json(paginated_response))
}

#[get("/{project_id_path}")]
pub async fn get_project_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    project_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::projects;

    let project_to_find_id = project_id_path.into_inner();

    let cache_key = cache::project_metrics_key(project_to_find_id);
    if let Some(cached) = project_cache.get(&cache_key) {
        return Ok(HttpResponse::Ok().json(cached));
    }

    let mut conn = pool.get().await?;

    let project_option = projects::table
        .filter(projects::id.eq(project_to_find_id))
        .select(Project::as_select())
        .first::<Project>(&mut conn)
        .await
        .optional()
        .map_err(ServiceError::from)?;

    match project_option {
        Some(project) => {
            let (task_count, estimated_sum, spent_sum) =
                load_project_totals(&mut conn, project.id).await?;
            let response =
                ProjectApiResponse::from_parts(project, task_count, estimated_sum, spent_sum);

            let payload = serde_json::to_value(&response).map_err(|e| {
                log::error!("Failed to serialize project {}: {}", response.id, e);
                ServiceError::InternalServerError("Failed to serialize project".to_string())
            })?;
            project_cache.set(&cache_key, payload);

            Ok(HttpResponse::Ok().json(response))
        }
        None => Err(ServiceError::NotFound(format!(
            "Project with id {} not found",
            project_to_find_id
        ))),
    }
}

#[put("/{project_id_path}")]
pub async fn update_project_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    project_id_path: web::Path<Uuid>,
    payload: web::Json<UpdateProjectPayload>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::projects;

    let project_to_update_id = project_id_path.into_inner();

    let project_changes = UpdateProjectChangeset {
        title: payload.title.clone(),
        description: payload.description.clone(),
        updated_at: Some(Utc::now()),
    };

    let mut conn = pool.get().await?;

    let updated_project =
        diesel::update(projects::table.filter(projects::id.eq(project_to_update_id)))
            .set(&project_changes)
            .get_result::<Project>(&mut conn)
            .await
            .map_err(ServiceError::from)?;

    // Cached metrics embed the title, so drop them on any update.
    project_cache.delete(&cache::project_metrics_key(project_to_update_id));

    let (task_count, estimated_sum, spent_sum) =
        load_project_totals(&mut conn, updated_project.id).await?;
    let response =
        ProjectApiResponse::from_parts(updated_project, task_count, estimated_sum, spent_sum);

    Ok(HttpResponse::Ok().json(response))
}

#[delete("/{project_id_path}")]
pub async fn delete_project_handler(
    pool: web::Data<DbPool>,
    project_cache: web::Data<DashboardCache>,
    project_id_path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::projects;

    let project_to_delete_id = project_id_path.into_inner();

    let mut conn = pool.get().await?;

    // Tasks and their time entries go with it via ON DELETE CASCADE.
    let num_deleted =
        diesel::delete(projects::table.filter(projects::id.eq(project_to_delete_id)))
            .execute(&mut conn)
            .await
            .map_err(ServiceError::from)?;

    if num_deleted > 0 {
        project_cache.delete(&cache::project_metrics_key(project_to_delete_id));
        project_cache.delete(&cache::dashboard_key(None, None));

        Ok(HttpResponse::Ok().json(json!({
            "status": "success",
            "message": format!("Project with id {} deleted successfully", project_to_delete_id)
        })))
    } else {
        Err(ServiceError::NotFound(format!(
            "Project with id {} not found to delete",
            project_to_delete_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_default_to_unfiltered_first_page() {
        let query: ProjectQueryParams = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(query.search, None);
        assert_eq!(query.page, None);

        let query: ProjectQueryParams = serde_json::from_str(r#"{"search": "web"}"#).unwrap();
        assert_eq!(query.search.as_deref(), Some("web"));
    }
}
