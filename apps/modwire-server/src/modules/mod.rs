//! The demo application: settings, users, auth and a health probe.
//!
//! ```text
//! AppModule
//! ├── SettingsModule (global: AppConfig)
//! └── AuthModule
//!     └── UsersModule (exports UserStore, Sessions)
//! ```

mod auth;
mod health;
mod settings;
mod users;

use modwire::{Module, ModuleConfig};
use runtime::AppConfig;
use std::sync::Arc;

use auth::AuthModule;
use settings::SettingsModule;

pub struct AppModule {
    app_config: AppConfig,
}

impl AppModule {
    pub fn new(app_config: AppConfig) -> Self {
        Self { app_config }
    }
}

impl Module for AppModule {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new()
            .import(SettingsModule::new(self.app_config.clone()))
            .import(AuthModule)
            .controller(|r| {
                Ok(Arc::new(health::HealthController {
                    app_config: r.resolve()?,
                }))
            })
    }
}
