use std::sync::Arc;

use lib_common::connections::EventStore;
use lib_common::core::BroadcastRegistry;
use lib_common::security::SignatureValidator;
use subtle::ConstantTimeEq;

/// Shared handles passed to every handler through axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<SignatureValidator>,
    pub registry: Arc<BroadcastRegistry>,
    pub store: Arc<dyn EventStore>,
    api_token: Arc<str>,
}

impl AppState {
    pub fn new(
        validator: SignatureValidator,
        registry: BroadcastRegistry,
        store: Arc<dyn EventStore>,
        api_token: &str,
    ) -> Self {
        Self {
            validator: Arc::new(validator),
            registry: Arc::new(registry),
            store,
            api_token: Arc::from(api_token),
        }
    }

    pub fn token_matches(&self, presented: &str) -> bool {
        self.api_token.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}
