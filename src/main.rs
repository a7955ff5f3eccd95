mod cache;
mod db;
mod error_handler;
mod handlers;
mod models;
pub mod schema;
mod timefmt;

use actix_cors::Cors;
use actix_web::{http::header, middleware::Logger, web, App, HttpResponse, HttpServer};
use cache::DashboardCache;
use db::DbPool;
use std::env;

async fn health_check_handler(
    pool: web::Data<DbPool>,
) -> Result<HttpResponse, error_handler::ServiceError> {
    match pool.get().await {
        Ok(_conn) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "message": "Backend is running and DB pool accessible"
        }))),
        Err(e) => {
            log::error!("Failed to get connection from pool: {:?}", e);
            Err(error_handler::ServiceError::InternalServerError(
                "Failed to check DB pool".to_string(),
            ))
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    if cfg!(debug_assertions) {
        match dotenvy::dotenv() {
            Ok(path) => log::info!(".env file loaded from path: {}", path.display()),
            Err(e) => log::warn!(
                "Could not load .env file: {}, using environment variables.",
                e
            ),
        }
    }

    let database_url = env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set in environment variables or .env file");

    let pool = db::create_pool(&database_url)
        .await
        .expect("Failed to create database connection pool.");

    // One cache handle shared by every worker; handlers receive it via
    // web::Data rather than a process-wide static.
    let dashboard_cache = web::Data::new(DashboardCache::default());

    log::info!("Timetrack Backend Service starting...");

    let frontend_url =
        env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .expect("PORT must be a valid number");

    log::info!("Server will start at http://{}:{}", host, port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                header::AUTHORIZATION,
                header::ACCEPT,
                header::CONTENT_TYPE,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(web::Data::new(pool.clone()))
            .app_data(dashboard_cache.clone())
            .service(web::resource("/health").route(web::get().to(health_check_handler)))
            .service(
                web::scope("/projects")
                    .service(handlers::project_handlers::create_project_handler)
                    .service(handlers::project_handlers::list_projects_handler)
                    .service(handlers::project_handlers::get_project_handler)
                    .service(handlers::project_handlers::update_project_handler)
                    .service(handlers::project_handlers::delete_project_handler),
            )
            .service(
                web::scope("/tasks")
                    .service(handlers::task_handlers::create_task_handler)
                    .service(handlers::task_handlers::list_tasks_handler)
                    .service(handlers::timer_handlers::start_timer_handler)
                    .service(handlers::timer_handlers::stop_timer_handler)
                    .service(handlers::task_handlers::get_task_handler)
                    .service(handlers::task_handlers::update_task_handler)
                    .service(handlers::task_handlers::delete_task_handler),
            )
            .service(handlers::dashboard_handlers::dashboard_overview_handler)
    })
    .bind(format!("{}:{}", host, port))?
    .run()
    .await
}
