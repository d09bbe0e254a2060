use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::notifications::{self, NotificationChannel};

/// Shared handles threaded through the daemon.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let notifier = notifications::create_notifier(&config.notification);
        Self {
            config: Arc::new(config),
            db,
            notifier,
        }
    }
}
