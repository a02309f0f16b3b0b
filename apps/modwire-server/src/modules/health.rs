use axum::Json;
use modwire::{Controller, ControllerConfig, RouteConfig};
use runtime::AppConfig;
use std::sync::Arc;

pub(crate) struct HealthController {
    pub(crate) app_config: Arc<AppConfig>,
}

impl Controller for HealthController {
    fn config(&self) -> ControllerConfig {
        let cfg = self.app_config.clone();
        ControllerConfig::new("").route(RouteConfig::any("/health", move || {
            let cfg = cfg.clone();
            async move {
                Json(serde_json::json!({
                    "status": "ok",
                    "listen": format!("{}:{}", cfg.server.host, cfg.server.port),
                }))
            }
        }))
    }
}
