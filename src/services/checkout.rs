//! Checkout orchestrator.
//!
//! Converts a cart snapshot into an order. The critical section is one
//! database transaction covering the order insert, every inventory
//! reservation, and the cart clear: any failure rolls the whole step back,
//! so no order ever references unreserved stock and no stock is held by an
//! order that was never created. Stock pre-checks outside the transaction
//! exist only to produce better error messages.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::DbPool;
use crate::entities::order::{self, Entity as Order, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::pricing::{self, PricedLine};
use crate::services::carts::CartService;
use crate::services::inventory::InventoryService;
use crate::services::orders::{OrderLineInput, OrderResponse, OrderService};

/// Input for creating an order from the caller's cart.
#[derive(Debug)]
pub struct CreateOrderInput {
    /// Opaque structured shipping address, stored verbatim.
    pub shipping_address: Value,
    pub payment_method: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    carts: CartService,
    orders: OrderService,
    inventory: InventoryService,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        carts: CartService,
        orders: OrderService,
        inventory: InventoryService,
    ) -> Self {
        Self {
            db,
            event_sender,
            carts,
            orders,
            inventory,
        }
    }

    /// Creates an order from the user's cart.
    ///
    /// Reads the cart, pre-checks stock for friendlier errors, prices the
    /// basket, then in a single transaction inserts the order with frozen
    /// line prices, reserves stock line by line via the conditional
    /// decrement, and clears the cart. A reservation failure aborts
    /// everything.
    #[instrument(skip(self, input), fields(user_id = %user_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderResponse, ServiceError> {
        if input.payment_method.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Payment method is required".to_string(),
            ));
        }

        let snapshot = self
            .carts
            .snapshot(&*self.db, user_id)
            .await?
            .filter(|snap| !snap.lines.is_empty())
            .ok_or_else(|| ServiceError::ValidationError("Cart is empty".to_string()))?;

        // Advisory pre-check: catches obvious shortfalls with the product
        // name before any work is done. The conditional reservation below
        // is the authoritative check.
        for (line, product) in &snapshot.lines {
            if product.stock < line.quantity {
                return Err(ServiceError::InsufficientStock(product.name.clone()));
            }
        }

        let quote = pricing::quote(
            &snapshot
                .lines
                .iter()
                .map(|(line, product)| PricedLine {
                    quantity: line.quantity,
                    unit_price: product.price,
                })
                .collect::<Vec<_>>(),
        );

        let order_lines: Vec<OrderLineInput> = snapshot
            .lines
            .iter()
            .map(|(line, product)| OrderLineInput {
                product_id: product.id,
                quantity: line.quantity,
                unit_price: product.price,
            })
            .collect();

        let txn = self.db.begin().await?;

        let order = OrderService::insert_order(
            &txn,
            user_id,
            &order_lines,
            input.shipping_address,
            input.payment_method,
            quote,
        )
        .await?;

        for (line, product) in &snapshot.lines {
            self.inventory
                .reserve(&txn, line.product_id, line.quantity)
                .await
                .map_err(|err| match err {
                    // Re-label with the product name for the client.
                    ServiceError::InsufficientStock(_) => {
                        ServiceError::InsufficientStock(product.name.clone())
                    }
                    other => other,
                })?;
        }

        CartService::clear_lines(&txn, snapshot.cart.id).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCreated(order.id))
            .await;
        self.event_sender
            .send_or_log(Event::CartCleared(snapshot.cart.id))
            .await;

        info!(order_id = %order.id, user_id = %user_id, total = %order.total_price, "order created from cart");

        self.orders.get(order.id).await
    }

    /// Cancels a pending order on behalf of its owner or an administrator.
    ///
    /// Releases every line's reserved quantity back to inventory and sets
    /// `cancelled`, both inside one transaction. Orders past `pending`
    /// cannot be cancelled.
    #[instrument(skip(self, acting_user), fields(order_id = %order_id, user_id = %acting_user.user_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        acting_user: &AuthUser,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.orders.get_model(order_id).await?;

        if order.user_id != acting_user.user_id && !acting_user.is_admin() {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }

        let cancelled = self.cancel_if_pending(order_id).await?;
        if !cancelled {
            let order = self.orders.get_model(order_id).await?;
            return Err(ServiceError::InvalidTransition(format!(
                "Cannot cancel an order in status {}",
                order.status
            )));
        }

        self.orders.get(order_id).await
    }

    /// Conditionally cancels an order, releasing its stock, iff it is still
    /// `pending` at the time of the write. Returns `false` (a no-op) when it
    /// is not.
    ///
    /// The status flip is a conditional update (`WHERE status = 'pending'`),
    /// not a read-then-write: a failed-payment webhook racing a user
    /// cancellation (or a concurrent `mark_paid`) must not release stock
    /// twice or cancel a paid order, and under read-committed isolation two
    /// transactions can both read `pending` before either commits. Exactly
    /// one writer sees a row affected; only that one releases.
    pub(crate) async fn cancel_if_pending(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let old_status = order.status;

        let flipped = Order::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Cancelled),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;

        if flipped.rows_affected == 0 {
            txn.commit().await?;
            return Ok(false);
        }

        let lines = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        for line in &lines {
            self.inventory
                .release(&txn, line.product_id, line.quantity)
                .await?;
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: OrderStatus::Cancelled.to_string(),
            })
            .await;

        info!(order_id = %order_id, lines = lines.len(), "order cancelled, stock released");
        Ok(true)
    }

    /// Read-only order projection with the same ownership rule as cancel.
    #[instrument(skip(self, acting_user), fields(order_id = %order_id, user_id = %acting_user.user_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        acting_user: &AuthUser,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.orders.get(order_id).await?;

        if order.user_id != acting_user.user_id && !acting_user.is_admin() {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }

        Ok(order)
    }
}
