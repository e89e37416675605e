use blockdump::{Config, JobManager};
use std::time::Instant;

pub struct AppState {
    pub config: Config,
    pub manager: JobManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, manager: JobManager) -> Self {
        Self {
            config,
            manager,
            started_at: Instant::now(),
        }
    }
}
