//! Inventory ledger.
//!
//! Stock mutation goes exclusively through the conditional decrement /
//! additive increment below. Both operations take the caller's connection so
//! several reservations compose inside one enclosing transaction; the
//! conditional `WHERE stock >= qty` evaluated under that transaction is what
//! keeps stock from ever going negative under concurrency. No stock value is
//! cached in-process.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DbPool>,
}

impl InventoryService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Best-effort read of the currently available stock.
    ///
    /// Only suitable for advisory pre-checks and projections; the
    /// authoritative check is the conditional update in [`reserve`].
    ///
    /// [`reserve`]: InventoryService::reserve
    #[instrument(skip(self))]
    pub async fn available(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        Ok(product.stock)
    }

    /// Atomically reserves `quantity` units of a product.
    ///
    /// Executes `stock = stock - quantity WHERE id = ? AND stock >= quantity`
    /// on the provided connection. Zero rows affected means the stock was
    /// insufficient (or the product vanished) and nothing was changed.
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Reservation quantity must be at least 1".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InsufficientStock(format!(
                "Product {} has insufficient stock for quantity {}",
                product_id, quantity
            )));
        }

        debug!(product_id = %product_id, quantity = quantity, "stock reserved");
        Ok(())
    }

    /// Returns `quantity` units of a product to available stock.
    ///
    /// Unconditional additive update, used when a pending order is
    /// cancelled. Fails with `NotFound` if the product row is gone.
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Release quantity must be at least 1".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        debug!(product_id = %product_id, quantity = quantity, "stock released");
        Ok(())
    }
}
