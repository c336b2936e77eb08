use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order header entity.
///
/// Created atomically from a cart snapshot and never deleted. The price
/// columns are frozen at creation; catalog changes never touch them.
/// `payment_result` stores the processor's payload verbatim as received.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub payment_method: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub items_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_price: Decimal,
    pub is_paid: bool,
    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,
    pub is_delivered: bool,
    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_result: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }

        if let ActiveValue::NotSet = active_model.updated_at {
            active_model.updated_at = Set(now);
        }

        Ok(active_model)
    }
}

/// Order lifecycle states.
///
/// Forward flow is `pending -> processing -> shipped -> delivered`;
/// `cancelled` is reachable from `pending` only. `delivered` and
/// `cancelled` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    /// Position in the forward flow; `None` for `cancelled`.
    fn rank(self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Processing => Some(1),
            OrderStatus::Shipped => Some(2),
            OrderStatus::Delivered => Some(3),
            OrderStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Moves along the forward flow may skip intermediate states, but never
    /// go backwards or leave a terminal state. Cancellation is allowed from
    /// `pending` only: by then stock has been reserved exactly once and
    /// nothing has been charged, so the reservation can be handed back.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self == next {
            return false;
        }
        match (self.rank(), next.rank()) {
            // Forward flow, skips allowed
            (Some(from), Some(to)) => to > from,
            // Cancellation edge
            (Some(_), None) => self == OrderStatus::Pending,
            // Nothing leaves cancelled
            (None, _) => false,
        }
    }
}
