pub mod handlers;
pub mod logging;
pub mod server;

pub use handlers::{cancel_job, expand_path, format_job_status, graph_report, init_database};
pub use server::router;
