//! Thin catalog surface: the read API the checkout core consumes
//! (`{price, stock}` per product) plus an admin create used for seeding.
//! Search, filtering, pagination and image handling are out of scope.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, QueryOrder, Set};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Input for creating a product
#[derive(Debug, Deserialize)]
pub struct CreateProductInput {
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub stock: i32,
}

#[derive(Clone)]
pub struct ProductService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl ProductService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a catalog product.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create(&self, input: CreateProductInput) -> Result<product::Model, ServiceError> {
        if input.name.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Product name must not be empty".to_string(),
            ));
        }
        if input.price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Product price must not be negative".to_string(),
            ));
        }
        if input.stock < 0 {
            return Err(ServiceError::ValidationError(
                "Product stock must not be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            description: Set(input.description),
            price: Set(input.price),
            stock: Set(input.stock),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let product = model.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::ProductCreated(product.id))
            .await;

        info!(product_id = %product.id, "product created");
        Ok(product)
    }

    /// Fetches a product by id.
    #[instrument(skip(self))]
    pub async fn get(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Lists all products, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<product::Model>, ServiceError> {
        Ok(Product::find()
            .order_by_desc(product::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}
