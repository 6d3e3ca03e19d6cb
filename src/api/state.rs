use std::sync::Arc;

use crate::service::SpeedService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SpeedService>,
}
