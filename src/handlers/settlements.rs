use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use crate::db::queries;
use crate::error::AppError;
use crate::handlers::Pagination;
use crate::AppState;

pub async fn list_settlements(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, AppError> {
    let settlements =
        queries::list_settlements(&state.db, pagination.limit(), pagination.offset()).await?;
    Ok(Json(settlements))
}
