use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{models::Order, queries};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub product_id: String,
    pub buyer_id: String,
    pub quantity: i32,
}

#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
}

impl OrderService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an order, decrementing product stock in the same database
    /// transaction. The conditional decrement is the only oversell guard:
    /// losers of the race see zero affected rows and the whole transaction
    /// rolls back.
    pub async fn create(&self, req: &CreateOrderRequest) -> Result<Order, AppError> {
        let product_id = validate_create_request(req)?;

        let mut tx = self.pool.begin().await?;

        if !queries::decrement_stock(&mut tx, product_id, req.quantity).await? {
            tx.rollback().await?;
            return Err(AppError::InsufficientStock);
        }

        let order = queries::insert_order(&mut tx, product_id, &req.buyer_id, req.quantity).await?;
        tx.commit().await?;

        tracing::debug!(order_id = %order.id, product_id = %product_id, quantity = req.quantity, "order created");
        Ok(order)
    }

    pub async fn get(&self, id: Uuid) -> Result<Order, AppError> {
        queries::get_order(&self.pool, id)
            .await
            .map_err(|e| AppError::not_found_or_db(e, format!("Order {id} not found")))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Order>, AppError> {
        Ok(queries::list_orders(&self.pool, limit, offset).await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let affected = queries::delete_order(&self.pool, id).await?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("Order {id} not found")));
        }
        Ok(())
    }
}

fn validate_create_request(req: &CreateOrderRequest) -> Result<Uuid, AppError> {
    let product_id = Uuid::parse_str(&req.product_id)
        .map_err(|_| AppError::Validation("product_id must be a valid UUID".to_string()))?;
    if req.buyer_id.trim().is_empty() {
        return Err(AppError::Validation("buyer_id must not be empty".to_string()));
    }
    if req.quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".to_string()));
    }
    Ok(product_id)
}
