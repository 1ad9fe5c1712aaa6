use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::queries;
use crate::error::AppError;
use crate::handlers::Pagination;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    pub name: String,
    pub stock: i32,
}

fn validate(req: &ProductRequest) -> Result<(), AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    if req.stock < 0 {
        return Err(AppError::Validation("stock must not be negative".to_string()));
    }
    Ok(())
}

pub async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<ProductRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate(&req)?;
    let product = queries::insert_product(&state.db, &req.name, req.stock).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let product = queries::get_product(&state.db, id)
        .await
        .map_err(|e| AppError::not_found_or_db(e, format!("Product {id} not found")))?;
    Ok(Json(product))
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, AppError> {
    let products =
        queries::list_products(&state.db, pagination.limit(), pagination.offset()).await?;
    Ok(Json(products))
}

pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProductRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate(&req)?;
    let product = queries::update_product(&state.db, id, &req.name, req.stock)
        .await
        .map_err(|e| AppError::not_found_or_db(e, format!("Product {id} not found")))?;
    Ok(Json(product))
}

pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let affected = queries::delete_product(&state.db, id).await?;
    if affected == 0 {
        return Err(AppError::NotFound(format!("Product {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}
