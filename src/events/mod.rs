use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the services.
///
/// Events are observability-only: no correctness depends on delivery, so a
/// full channel drops the event with a warning instead of blocking the
/// request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentIntentCreated {
        order_id: Uuid,
        payment_intent_id: String,
    },
    PaymentSucceeded(Uuid),
    PaymentFailed(Uuid),

    // Cart events
    CartUpdated(Uuid),
    CartCleared(Uuid),

    // Catalog events
    ProductCreated(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is
    /// closed or full.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "event dropped");
        }
    }
}

/// Consumes events from the channel and logs them. Spawned once from `main`.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "order created");
            }
            Event::OrderCancelled(order_id) => {
                info!(order_id = %order_id, "order cancelled");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "order status changed"
                );
            }
            Event::PaymentIntentCreated {
                order_id,
                payment_intent_id,
            } => {
                info!(
                    order_id = %order_id,
                    payment_intent_id = %payment_intent_id,
                    "payment intent created"
                );
            }
            Event::PaymentSucceeded(order_id) => {
                info!(order_id = %order_id, "payment succeeded");
            }
            Event::PaymentFailed(order_id) => {
                info!(order_id = %order_id, "payment failed");
            }
            Event::CartUpdated(cart_id) => {
                info!(cart_id = %cart_id, "cart updated");
            }
            Event::CartCleared(cart_id) => {
                info!(cart_id = %cart_id, "cart cleared");
            }
            Event::ProductCreated(product_id) => {
                info!(product_id = %product_id, "product created");
            }
        }
    }
    info!("event channel closed; processor exiting");
}
