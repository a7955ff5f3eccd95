use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error_handler::ServiceError;
use crate::models::Task;

pub type DbPool = Pool<AsyncPgConnection>;

pub async fn create_pool(database_url: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().max_size(10).build(config).await?;

    Ok(pool)
}

/// Fetches a task under `SELECT ... FOR UPDATE`. Must be called inside a
/// transaction; the row lock serializes the timer check-then-act sequence for
/// that task until the transaction commits or rolls back.
pub async fn lock_task(
    conn: &mut AsyncPgConnection,
    task_lookup_id: Uuid,
) -> Result<Option<Task>, ServiceError> {
    use crate::schema::tasks::dsl::*;

    tasks
        .filter(id.eq(task_lookup_id))
        .select(Task::as_select())
        .for_update()
        .first::<Task>(conn)
        .await
        .optional()
        .map_err(ServiceError::from)
}
