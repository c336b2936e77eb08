//! Order ledger.
//!
//! Orders are immutable once created: line prices are copied from the
//! catalog at insertion time and never re-read, and nothing is ever deleted.
//! All lifecycle movement goes through the `OrderStatus` state machine.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as Order, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::entities::product::Entity as Product;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::pricing::PriceQuote;
use rust_decimal::Decimal;

/// One line of an order to be created. `unit_price` is the catalog price at
/// the moment of creation and is frozen into the order line verbatim.
#[derive(Debug, Clone)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Order line projection with the frozen price and the product's current
/// name for display.
#[derive(Debug, Serialize)]
pub struct OrderLineResponse {
    pub product_id: Uuid,
    pub product_name: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
}

/// Full order projection: header plus lines.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: String,
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub total_price: Decimal,
    pub is_paid: bool,
    pub paid_at: Option<chrono::DateTime<Utc>>,
    pub is_delivered: bool,
    pub delivered_at: Option<chrono::DateTime<Utc>>,
    pub shipping_address: Value,
    pub payment_result: Option<Value>,
    pub items: Vec<OrderLineResponse>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Inserts the order header and one line per input on the caller's
    /// connection. Runs inside checkout's transaction so the insert commits
    /// or rolls back together with the inventory reservations.
    pub(crate) async fn insert_order<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        lines: &[OrderLineInput],
        shipping_address: Value,
        payment_method: String,
        quote: PriceQuote,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let header = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            payment_method: Set(payment_method),
            items_price: Set(quote.items_price),
            shipping_price: Set(quote.shipping_price),
            total_price: Set(quote.total_price),
            is_paid: Set(false),
            paid_at: Set(None),
            is_delivered: Set(false),
            delivered_at: Set(None),
            status: Set(OrderStatus::Pending),
            shipping_address: Set(shipping_address),
            payment_result: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = header.insert(conn).await?;

        for line in lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                quantity: Set(line.quantity),
                price: Set(line.unit_price),
                created_at: Set(now),
            }
            .insert(conn)
            .await?;
        }

        Ok(order)
    }

    /// Fetches an order with its lines. Authorization is the caller's
    /// responsibility.
    #[instrument(skip(self))]
    pub async fn get(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = self.load_items(order_id).await?;
        Ok(Self::to_response(order, items))
    }

    /// Fetches the bare order header.
    pub async fn get_model(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Lists a user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OrderResponse>, ServiceError> {
        let orders = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        self.to_responses(orders).await
    }

    /// Lists every order, newest first. Admin-only at the call site.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<OrderResponse>, ServiceError> {
        let orders = Order::find()
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        self.to_responses(orders).await
    }

    /// Moves an order along the status state machine.
    ///
    /// Setting `delivered` also stamps the delivery flags atomically with
    /// the status write. The `cancelled` edge is rejected here: cancellation
    /// must release reserved stock and therefore goes through the checkout
    /// service's cancel path.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        if new_status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidTransition(
                "Use the cancellation endpoint to cancel an order".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidTransition(format!(
                "Cannot move order from {} to {}",
                old_status, new_status
            )));
        }

        let now = Utc::now();
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        if new_status == OrderStatus::Delivered {
            active.is_delivered = Set(true);
            active.delivered_at = Set(Some(now));
        }
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        info!(order_id = %order_id, old_status = %old_status, new_status = %new_status, "order status updated");

        let items = self.load_items(order_id).await?;
        Ok(Self::to_response(updated, items))
    }

    /// Records a successful payment: `is_paid`, `paid_at`, the processor's
    /// result payload, and the move to `processing`.
    ///
    /// Idempotent by design: the payment processor may redeliver events, so
    /// an already-paid order is a no-op (the original `paid_at` and payment
    /// result are kept), not an error. The write carries `WHERE is_paid =
    /// false` so even two deliveries racing under read-committed isolation
    /// apply the payment once; the loser observes zero rows affected.
    #[instrument(skip(self, payment_result))]
    pub async fn mark_paid(
        &self,
        order_id: Uuid,
        payment_result: Value,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.get_model(order_id).await?;

        if order.is_paid {
            info!(order_id = %order_id, "order already paid; ignoring duplicate payment event");
            let items = self.load_items(order_id).await?;
            return Ok(Self::to_response(order, items));
        }

        if order.status != OrderStatus::Pending {
            warn!(
                order_id = %order_id,
                status = %order.status,
                "payment succeeded for a non-pending order"
            );
        }

        let now = Utc::now();
        let old_status = order.status;
        let result = Order::update_many()
            .col_expr(order::Column::IsPaid, Expr::value(true))
            .col_expr(order::Column::PaidAt, Expr::value(now))
            .col_expr(order::Column::PaymentResult, Expr::value(payment_result))
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Processing),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            info!(order_id = %order_id, "order already paid; ignoring duplicate payment event");
            return self.get(order_id).await;
        }

        self.event_sender
            .send_or_log(Event::PaymentSucceeded(order_id))
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: OrderStatus::Processing.to_string(),
            })
            .await;

        info!(order_id = %order_id, "order marked paid");

        self.get(order_id).await
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<OrderLineResponse>, ServiceError> {
        let rows = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .find_also_related(Product)
            .all(&*self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(line, product)| OrderLineResponse {
                product_id: line.product_id,
                product_name: product.map(|p| p.name),
                quantity: line.quantity,
                price: line.price,
            })
            .collect())
    }

    async fn to_responses(
        &self,
        orders: Vec<order::Model>,
    ) -> Result<Vec<OrderResponse>, ServiceError> {
        let mut responses = Vec::with_capacity(orders.len());
        for order in orders {
            let items = self.load_items(order.id).await?;
            responses.push(Self::to_response(order, items));
        }
        Ok(responses)
    }

    fn to_response(model: order::Model, items: Vec<OrderLineResponse>) -> OrderResponse {
        OrderResponse {
            id: model.id,
            user_id: model.user_id,
            status: model.status,
            payment_method: model.payment_method,
            items_price: model.items_price,
            shipping_price: model.shipping_price,
            total_price: model.total_price,
            is_paid: model.is_paid,
            paid_at: model.paid_at,
            is_delivered: model.is_delivered,
            delivered_at: model.delivered_at,
            shipping_address: model.shipping_address,
            payment_result: model.payment_result,
            items,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}
