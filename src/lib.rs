pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod services;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;

use crate::services::orders::OrderService;
use crate::services::settlement::JobManager;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub orders: OrderService,
    pub jobs: Arc<JobManager>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/products",
            post(handlers::products::create_product).get(handlers::products::list_products),
        )
        .route(
            "/api/products/:id",
            get(handlers::products::get_product)
                .put(handlers::products::update_product)
                .delete(handlers::products::delete_product),
        )
        .route(
            "/api/orders",
            post(handlers::orders::create_order).get(handlers::orders::list_orders),
        )
        .route(
            "/api/orders/:id",
            get(handlers::orders::get_order).delete(handlers::orders::delete_order),
        )
        .route("/jobs/settlement", post(handlers::jobs::create_settlement_job))
        .route("/jobs/:id", get(handlers::jobs::get_job))
        .route("/jobs/:id/cancel", post(handlers::jobs::cancel_job))
        .route("/downloads/:filename", get(handlers::jobs::download_artifact))
        .route("/settlements", get(handlers::settlements::list_settlements))
        .with_state(state)
}
