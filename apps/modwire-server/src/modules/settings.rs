use modwire::{Module, ModuleConfig};
use runtime::AppConfig;
use std::sync::Arc;

/// Makes the loaded [`AppConfig`] resolvable from every module.
pub struct SettingsModule {
    app_config: Arc<AppConfig>,
}

impl SettingsModule {
    pub fn new(app_config: AppConfig) -> Self {
        Self {
            app_config: Arc::new(app_config),
        }
    }
}

impl Module for SettingsModule {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new()
            .global()
            .provide_value(self.app_config.clone())
            .export::<AppConfig>()
    }
}
