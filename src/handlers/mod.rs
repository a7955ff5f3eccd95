pub mod dashboard_handlers;
pub mod project_handlers;
pub mod task_handlers;
pub mod timer_handlers;
