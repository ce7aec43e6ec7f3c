use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::{sync::Arc, time::Duration};

use crate::replay_guard::ReplayGuard;

pub type AppState = Arc<State>;

pub struct State {
    pub db: DatabaseConnection,
    pub stripe_client: Option<stripe::Client>,
    /// Shared secret for verifying webhook signatures. Without it the
    /// webhook endpoint rejects every delivery.
    pub webhook_secret: Option<String>,
    pub replay_guard: ReplayGuard,
}

impl State {
    pub async fn new() -> Self {
        let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let mut opt = ConnectOptions::new(db_url);
        opt.max_connections(10)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8));

        let db = Database::connect(opt)
            .await
            .expect("Failed to connect to database");

        let stripe_client = match std::env::var("STRIPE_SECRET_KEY") {
            Ok(key) => Some(stripe::Client::new(key)),
            Err(_) => {
                tracing::warn!("STRIPE_SECRET_KEY not set, checkout creation disabled");
                None
            }
        };

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook endpoint will reject all events");
        }

        Self {
            db,
            stripe_client,
            webhook_secret,
            replay_guard: ReplayGuard::new(),
        }
    }
}
