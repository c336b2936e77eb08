pub mod carts;
pub mod checkout;
pub mod inventory;
pub mod orders;
pub mod payments;
pub mod products;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;

/// All domain services, constructed once and shared through `AppState`.
#[derive(Clone)]
pub struct AppServices {
    pub products: products::ProductService,
    pub carts: carts::CartService,
    pub orders: orders::OrderService,
    pub inventory: inventory::InventoryService,
    pub checkout: checkout::CheckoutService,
    pub payments: payments::PaymentService,
}

impl AppServices {
    pub fn new(db: Arc<DbPool>, config: Arc<AppConfig>, event_sender: EventSender) -> Self {
        let products = products::ProductService::new(db.clone(), event_sender.clone());
        let carts = carts::CartService::new(db.clone(), event_sender.clone());
        let orders = orders::OrderService::new(db.clone(), event_sender.clone());
        let inventory = inventory::InventoryService::new(db.clone());
        let checkout = checkout::CheckoutService::new(
            db,
            event_sender.clone(),
            carts.clone(),
            orders.clone(),
            inventory.clone(),
        );
        let payments = payments::PaymentService::new(
            config,
            event_sender,
            orders.clone(),
            checkout.clone(),
        );

        Self {
            products,
            carts,
            orders,
            inventory,
            checkout,
            payments,
        }
    }
}
