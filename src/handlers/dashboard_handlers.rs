use crate::cache::{self, DashboardCache};
use crate::db::DbPool;
use crate::error_handler::ServiceError;
use crate::models::{
    DashboardResponse, DateRangeFilter, ProjectSpentRow, ProjectTimeSpent, TaskStatus,
};
use crate::timefmt::format_hh_mm;
use actix_web::{get, web, HttpResponse};
use chrono::NaiveDate;
use diesel::dsl::{count_star, sum};
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Date as DieselDate;
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use std::collections::BTreeMap;

// Dates are taken as raw strings so a malformed value can be reported per
// field instead of failing extraction wholesale.
#[derive(Deserialize, Debug)]
pub struct DashboardQueryParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn parse_filter_date(
    field: &str,
    raw: Option<&str>,
) -> Result<Option<NaiveDate>, ServiceError> {
    match raw {
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                ServiceError::BadRequest(format!("Invalid {} format. Use YYYY-MM-DD", field))
            }),
        None => Ok(None),
    }
}

fn validate_date_range(
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<(), ServiceError> {
    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start > end {
            return Err(ServiceError::BadRequest(
                "start_date cannot be after end_date".to_string(),
            ));
        }
    }
    Ok(())
}

/// Every known status appears, zero-filled, regardless of what the grouped
/// count query returned.
fn zero_filled_status_counts(rows: Vec<(String, i64)>) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = TaskStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for (status_value, count) in rows {
        counts.insert(status_value, count);
    }
    counts
}

// Wide sentinel bounds so one parameterized query covers half-open ranges.
const RANGE_FLOOR: &str = "1970-01-01";
const RANGE_CEIL: &str = "9999-12-31";

/// Dashboard overview: task counts per status, global estimated/spent totals,
/// and spent time per project, cached per exact date-range pair.
///
/// The date range deliberately only rescopes `time_spent_per_project` (to the
/// durations of entries closed within the range); `task_counts` and the two
/// totals always stay global. Callers rely on that asymmetry.
#[get("/dashboard")]
pub async fn dashboard_overview_handler(
    pool: web::Data<DbPool>,
    dashboard_cache: web::Data<DashboardCache>,
    query: web::Query<DashboardQueryParams>,
) -> Result<HttpResponse, ServiceError> {
    use crate::schema::tasks;

    let start_date = parse_filter_date("start_date", query.start_date.as_deref())?;
    let end_date = parse_filter_date("end_date", query.end_date.as_deref())?;
    validate_date_range(start_date, end_date)?;

    let cache_key = cache::dashboard_key(start_date, end_date);
    if let Some(cached) = dashboard_cache.get(&cache_key) {
        return Ok(HttpResponse::Ok().json(cached));
    }

    let mut conn = pool.get().await?;

    let status_rows = tasks::table
        .group_by(tasks::status)
        .select((tasks::status, count_star()))
        .load::<(String, i64)>(&mut conn)
        .await
        .map_err(|e| {
            log::error!("Database error counting tasks for dashboard: {:?}", e);
            ServiceError::from(e)
        })?;

    let (estimated_sum, spent_sum) = tasks::table
        .select((sum(tasks::estimated_seconds), sum(tasks::spent_seconds)))
        .first::<(Option<i64>, Option<i64>)>(&mut conn)
        .await
        .map_err(|e| {
            log::error!("Database error summing task times for dashboard: {:?}", e);
            ServiceError::from(e)
        })?;

    let range_filtered = start_date.is_some() || end_date.is_some();

    let project_rows: Vec<ProjectSpentRow> = if range_filtered {
        // Range mode sums closed entries whose start falls inside the
        // inclusive window; running entries are excluded.
        let floor = start_date
            .unwrap_or_else(|| NaiveDate::parse_from_str(RANGE_FLOOR, "%Y-%m-%d").unwrap());
        let ceil = end_date
            .unwrap_or_else(|| NaiveDate::parse_from_str(RANGE_CEIL, "%Y-%m-%d").unwrap());

        sql_query(
            "SELECT p.id AS project_id, p.title AS project_title, \
                    COALESCE(SUM(te.duration_seconds), 0) AS total_seconds \
             FROM projects p \
             LEFT JOIN tasks t ON t.project_id = p.id \
             LEFT JOIN time_entries te ON te.task_id = t.id \
                  AND te.end_time IS NOT NULL \
                  AND DATE(te.start_time AT TIME ZONE 'UTC') >= $1 \
                  AND DATE(te.start_time AT TIME ZONE 'UTC') <= $2 \
             GROUP BY p.id \
             ORDER BY p.created_at DESC",
        )
        .bind::<DieselDate, _>(floor)
        .bind::<DieselDate, _>(ceil)
        .load::<ProjectSpentRow>(&mut conn)
        .await
        .map_err(|e| {
            log::error!("Database error in filtered per-project sums: {:?}", e);
            ServiceError::from(e)
        })?
    } else {
        sql_query(
            "SELECT p.id AS project_id, p.title AS project_title, \
                    COALESCE(SUM(t.spent_seconds), 0) AS total_seconds \
             FROM projects p \
             LEFT JOIN tasks t ON t.project_id = p.id \
             GROUP BY p.id \
             ORDER BY p.created_at DESC",
        )
        .load::<ProjectSpentRow>(&mut conn)
        .await
        .map_err(|e| {
            log::error!("Database error in per-project sums: {:?}", e);
            ServiceError::from(e)
        })?
    };

    let date_range_filter = if range_filtered {
        Some(DateRangeFilter {
            start_date: query.start_date.clone(),
            end_date: query.end_date.clone(),
        })
    } else {
        None
    };

    let response = DashboardResponse {
        task_counts: zero_filled_status_counts(status_rows),
        total_estimated_time: format_hh_mm(estimated_sum),
        total_spent_time: format_hh_mm(spent_sum),
        time_spent_per_project: project_rows.into_iter().map(ProjectTimeSpent::from).collect(),
        date_range_filter,
    };

    let payload = serde_json::to_value(&response).map_err(|e| {
        log::error!("Failed to serialize dashboard response: {}", e);
        ServiceError::InternalServerError("Failed to serialize dashboard".to_string())
    })?;
    dashboard_cache.set(&cache_key, payload.clone());

    Ok(HttpResponse::Ok().json(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dates_parse() {
        let parsed = parse_filter_date("start_date", Some("2025-08-01")).unwrap();
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2025, 8, 1));
        assert_eq!(parse_filter_date("start_date", None).unwrap(), None);
    }

    #[test]
    fn malformed_dates_name_the_field() {
        let err = parse_filter_date("end_date", Some("08/30/2025")).unwrap_err();
        assert!(err.to_string().contains("end_date"));
        assert!(parse_filter_date("start_date", Some("2025-13-01")).is_err());
        assert!(parse_filter_date("start_date", Some("not-a-date")).is_err());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let start = NaiveDate::from_ymd_opt(2025, 8, 30);
        let end = NaiveDate::from_ymd_opt(2025, 8, 1);
        assert!(validate_date_range(start, end).is_err());
        // Equal bounds and half-open ranges are fine.
        assert!(validate_date_range(start, start).is_ok());
        assert!(validate_date_range(None, end).is_ok());
        assert!(validate_date_range(start, None).is_ok());
    }

    #[test]
    fn every_status_is_enumerated_even_at_zero() {
        let counts = zero_filled_status_counts(vec![("in_progress".to_string(), 3)]);
        assert_eq!(counts.get("todo"), Some(&0));
        assert_eq!(counts.get("in_progress"), Some(&3));
        assert_eq!(counts.get("done"), Some(&0));
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn sentinel_bounds_are_valid_dates() {
        assert!(NaiveDate::parse_from_str(RANGE_FLOOR, "%Y-%m-%d").is_ok());
        assert!(NaiveDate::parse_from_str(RANGE_CEIL, "%Y-%m-%d").is_ok());
    }
}
