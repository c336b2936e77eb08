//! Cart store.
//!
//! One cart per user, created lazily on first access. Cart lines hold only a
//! product reference and a quantity; prices are resolved live from the
//! catalog, so the denormalized `total_amount` is recomputed from current
//! product prices after every line mutation, inside the same transaction.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::cart::{self, Entity as Cart};
use crate::entities::cart_item::{self, Entity as CartItem};
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::pricing;

/// One cart line priced live from the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CartLineView {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Cart snapshot returned to the client: lines joined with product name and
/// current price, plus the denormalized total.
#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<CartLineView>,
    pub total_amount: Decimal,
}

/// A consistent cart read used by checkout: each line paired with the
/// product row backing it.
pub struct CartSnapshot {
    pub cart: cart::Model,
    pub lines: Vec<(cart_item::Model, product::Model)>,
}

#[derive(Clone)]
pub struct CartService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl CartService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's cart, creating an empty one on first access.
    ///
    /// Race-safe without an application lock: `carts.user_id` carries a
    /// unique index, so of two concurrent first accesses one insert loses;
    /// the loser re-selects the winner's row instead of surfacing the
    /// conflict.
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let fresh = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            total_amount: Set(Decimal::ZERO),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match fresh.insert(&*self.db).await {
            Ok(created) => {
                debug!(cart_id = %created.id, user_id = %user_id, "cart created");
                Ok(created)
            }
            // Lost the insert race: the unique index rejected us, so the
            // row must exist now.
            Err(insert_err) => Cart::find()
                .filter(cart::Column::UserId.eq(user_id))
                .one(&*self.db)
                .await?
                .ok_or(ServiceError::DatabaseError(insert_err)),
        }
    }

    /// Cart snapshot for display: lines joined with live product data.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartResponse, ServiceError> {
        let cart = self.get_or_create(user_id).await?;
        let lines = Self::load_lines(&*self.db, cart.id).await?;
        Ok(Self::to_response(cart, lines))
    }

    /// Consistent cart read for checkout, on the caller's connection.
    pub(crate) async fn snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<Option<CartSnapshot>, ServiceError> {
        let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?
        else {
            return Ok(None);
        };

        let lines = Self::load_lines(conn, cart.id).await?;
        Ok(Some(CartSnapshot { cart, lines }))
    }

    /// Adds `quantity` of a product to the cart, merging into an existing
    /// line for the same product.
    ///
    /// The stock check here covers the combined line quantity and is
    /// advisory; the authoritative reservation happens at checkout.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartResponse, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let cart = self.get_or_create(user_id).await?;
        let txn = self.db.begin().await?;

        let product = Product::find_by_id(product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        let merged_quantity = existing.as_ref().map_or(0, |line| line.quantity) + quantity;
        if product.stock < merged_quantity {
            return Err(ServiceError::InsufficientStock(product.name));
        }

        let now = Utc::now();
        if let Some(line) = existing {
            let mut line: cart_item::ActiveModel = line.into();
            line.quantity = Set(merged_quantity);
            line.updated_at = Set(now);
            line.update(&txn).await?;
        } else {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product_id),
                quantity: Set(quantity),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let (cart, lines) = self.recalculate_total(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(cart.id))
            .await;

        info!(cart_id = %cart.id, product_id = %product_id, quantity = quantity, "cart line added");
        Ok(Self::to_response(cart, lines))
    }

    /// Sets the quantity of an existing cart line.
    #[instrument(skip(self))]
    pub async fn set_item_quantity(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartResponse, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let cart = self.get_or_create(user_id).await?;
        let txn = self.db.begin().await?;

        let line = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} is not in the cart", product_id))
            })?;

        let product = Product::find_by_id(product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        if product.stock < quantity {
            return Err(ServiceError::InsufficientStock(product.name));
        }

        let mut line: cart_item::ActiveModel = line.into();
        line.quantity = Set(quantity);
        line.updated_at = Set(Utc::now());
        line.update(&txn).await?;

        let (cart, lines) = self.recalculate_total(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(cart.id))
            .await;

        Ok(Self::to_response(cart, lines))
    }

    /// Removes a product's line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartResponse, ServiceError> {
        let cart = self.get_or_create(user_id).await?;
        let txn = self.db.begin().await?;

        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;

        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {} is not in the cart",
                product_id
            )));
        }

        let (cart, lines) = self.recalculate_total(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(cart.id))
            .await;

        Ok(Self::to_response(cart, lines))
    }

    /// Empties the cart. The cart row itself is preserved.
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<CartResponse, ServiceError> {
        let cart = self.get_or_create(user_id).await?;
        let txn = self.db.begin().await?;

        Self::clear_lines(&txn, cart.id).await?;
        let cart = Cart::find_by_id(cart.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart.id)))?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartCleared(cart.id))
            .await;

        info!(cart_id = %cart.id, "cart cleared");
        Ok(Self::to_response(cart, Vec::new()))
    }

    /// Deletes all lines and zeroes the total, on the caller's connection.
    /// Used both by [`clear`](CartService::clear) and by checkout inside its
    /// order-creation transaction.
    pub(crate) async fn clear_lines<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;

        let mut cart: cart::ActiveModel = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?
            .into();
        cart.total_amount = Set(Decimal::ZERO);
        cart.updated_at = Set(Utc::now());
        cart.update(conn).await?;

        Ok(())
    }

    /// Recomputes the denormalized cart total from live product prices.
    async fn recalculate_total<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<(cart::Model, Vec<(cart_item::Model, product::Model)>), ServiceError> {
        let lines = Self::load_lines(conn, cart_id).await?;

        let total: Decimal = lines
            .iter()
            .map(|(line, product)| pricing::line_total(line.quantity, product.price))
            .sum();

        let mut cart: cart::ActiveModel = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?
            .into();
        cart.total_amount = Set(total);
        cart.updated_at = Set(Utc::now());
        let cart = cart.update(conn).await?;

        Ok((cart, lines))
    }

    async fn load_lines<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
    ) -> Result<Vec<(cart_item::Model, product::Model)>, ServiceError> {
        let rows = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .find_also_related(Product)
            .all(conn)
            .await?;

        rows.into_iter()
            .map(|(line, product)| {
                let product = product.ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "Cart line {} references missing product",
                        line.id
                    ))
                })?;
                Ok((line, product))
            })
            .collect()
    }

    fn to_response(
        cart: cart::Model,
        lines: Vec<(cart_item::Model, product::Model)>,
    ) -> CartResponse {
        let items: Vec<CartLineView> = lines
            .into_iter()
            .map(|(line, product)| CartLineView {
                product_id: product.id,
                product_name: product.name,
                quantity: line.quantity,
                unit_price: product.price,
                line_total: pricing::line_total(line.quantity, product.price),
            })
            .collect();

        // The total is always derived from the live line prices; the
        // denormalized column on the cart row may lag behind catalog
        // repricing until the next line mutation.
        let total_amount = items.iter().map(|item| item.line_total).sum();

        CartResponse {
            id: cart.id,
            user_id: cart.user_id,
            items,
            total_amount,
        }
    }
}
