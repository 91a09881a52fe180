//! Application state

use std::sync::Arc;

use membra_billing::BillingService;

use crate::{auth::JwtManager, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, config: &Config) -> Self {
        Self {
            billing,
            jwt_manager: JwtManager::new(&config.jwt_secret),
        }
    }
}
