use crate::{
    config::CheckoutConfig,
    db::DbPool,
    entities::order::{self, OrderStatus},
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{CorrelationIds, GatewayVerification, OrderContext, PaymentGatewayFactory},
    services::carts::CartStore,
    services::orders::{CorrelationUpdate, NewOrder, NewOrderItem, OrderStore},
    services::validation::{CartLine, OrderValidator, ShippingAddress},
    services::verifier::PaymentVerifier,
};
use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Checkout input as handed over by the HTTP layer.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<CartLine>,
    pub address: ShippingAddress,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Result of a successful checkout initiation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub merchant_tx_id: String,
    pub gateway: String,
    pub payment_url: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// Result of a verification, webhook or status-poll call.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusResponse {
    /// True when the order is (now or already) paid.
    pub success: bool,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub gateway: String,
    /// True when the order had already reached a terminal state and this
    /// call changed nothing (duplicate callback or webhook replay).
    pub already_processed: bool,
}

/// Composes validation, the order store, the gateway factory and the cart
/// collaborator into the four checkout/settlement operations.
///
/// Every payment-state change funnels through one compare-and-set transition,
/// so duplicate and racing callers converge on the same terminal result.
pub struct CheckoutOrchestrator {
    db: Arc<DbPool>,
    orders: OrderStore,
    gateways: Arc<PaymentGatewayFactory>,
    carts: Arc<dyn CartStore>,
    events: Option<Arc<EventSender>>,
    config: CheckoutConfig,
}

impl CheckoutOrchestrator {
    pub fn new(
        db: Arc<DbPool>,
        orders: OrderStore,
        gateways: Arc<PaymentGatewayFactory>,
        carts: Arc<dyn CartStore>,
        events: Option<Arc<EventSender>>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            db,
            orders,
            gateways,
            carts,
            events,
            config,
        }
    }

    /// Validates the cart, commits order + items + stock decrement in one
    /// transaction, then starts the payment with the configured gateway.
    ///
    /// The gateway call is an unavoidable non-transactional boundary: it
    /// happens after the commit, and on failure the order is marked failed
    /// and the stock compensation policy from the configuration applies.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn initiate_checkout(
        &self,
        user_id: Uuid,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        OrderValidator::validate_cart_items(&request.items)?;
        OrderValidator::validate_shipping_address(&request.address)?;

        let products = self.load_products(&request.items).await?;

        OrderValidator::validate_stock_availability(&request.items, |product_id| {
            let available = products.get(&product_id).map(|p| p.stock);
            async move { Ok(available) }
        })
        .await?;

        let (total_amount, items) = build_order_items(&request.items, &products)?;

        let gateway = self.gateways.default_gateway()?;
        let merchant_tx_id = generate_merchant_tx_id();
        let order_number = generate_order_number();

        // Transaction boundary A: order, items and stock reservation commit
        // or roll back together.
        let order = self
            .orders
            .create_order_with_items(
                NewOrder {
                    user_id,
                    order_number: order_number.clone(),
                    merchant_tx_id: merchant_tx_id.clone(),
                    gateway: gateway.name().to_string(),
                    currency: self.config.currency.clone(),
                    total_amount,
                    shipping_address: request.address,
                    notes: request.notes,
                },
                &items,
            )
            .await?;

        self.send_event(Event::OrderCreated(order.id)).await;

        let context = OrderContext {
            order_id: order.id,
            user_id,
            merchant_tx_id: merchant_tx_id.clone(),
            amount: total_amount,
            currency: self.config.currency.clone(),
        };

        match gateway.create_payment_request(&context).await {
            Ok(initiation) => {
                self.orders.set_provider_ids(order.id, &initiation).await?;

                info!(order_id = %order.id, gateway = gateway.name(), "Payment initiated");
                Ok(CheckoutResponse {
                    order_id: order.id,
                    order_number,
                    merchant_tx_id,
                    gateway: gateway.name().to_string(),
                    payment_url: initiation.payment_url,
                    amount: total_amount,
                    currency: self.config.currency.clone(),
                })
            }
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Payment initiation failed");
                self.fail_after_commit(&order, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Synchronous confirmation path, fed by the customer redirect. Also the
    /// funnel webhook deliveries and status polls converge on.
    #[instrument(skip(self, payload), fields(order_id = %order_id))]
    pub async fn verify_payment(
        &self,
        order_id: Uuid,
        payload: &Value,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let order = self.orders.get_order_required(order_id).await?;

        if let Some(response) = self.short_circuit_terminal(&order)? {
            return Ok(response);
        }

        let gateway = self.gateways.get(&order.gateway)?;
        let verification = gateway.verify_payment_response(payload).await?;

        self.apply_verification(order, verification).await
    }

    /// Polling fallback for when neither redirect nor webhook has arrived.
    #[instrument(skip(self))]
    pub async fn check_payment_status(
        &self,
        correlation_id: &str,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let order = match self.orders.find_by_merchant_tx_id(correlation_id).await? {
            Some(order) => order,
            None => self
                .orders
                .find_by_provider_order_id(correlation_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "No order correlates with transaction {correlation_id}"
                    ))
                })?,
        };

        if let Some(response) = self.short_circuit_terminal(&order)? {
            return Ok(response);
        }

        let gateway = self.gateways.get(&order.gateway)?;
        let verification = gateway
            .check_status(&CorrelationIds {
                merchant_tx_id: order.merchant_tx_id.clone(),
                provider_order_id: order.provider_order_id.clone(),
                provider_payment_id: order.provider_payment_id.clone(),
            })
            .await?;

        self.apply_verification(order, verification).await
    }

    /// Webhook state machine: signature check over the raw body, payload
    /// normalization, order resolution, then the shared pending-guarded
    /// transition. A replayed delivery is a guaranteed no-op.
    #[instrument(skip(self, raw_body, signature))]
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
        gateway_name: &str,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let gateway = self.gateways.get(gateway_name)?;

        // The signature covers the raw bytes; parsing anything first would
        // let a forged payload shape influence processing.
        if !gateway.verify_webhook_signature(raw_body, signature) {
            warn!(
                security = true,
                gateway = gateway_name,
                "Webhook rejected: signature verification failed"
            );
            self.send_event(Event::WebhookRejected {
                gateway: gateway_name.to_string(),
            })
            .await;
            return Err(ServiceError::InvalidSignature);
        }

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;
        let event = gateway.normalize_webhook(&payload)?;

        let order = self.resolve_webhook_order(&event).await?;

        if let Some(response) = self.short_circuit_terminal(&order)? {
            return Ok(response);
        }

        self.apply_verification(
            order,
            GatewayVerification {
                state: event.state,
                provider_order_id: event.provider_order_id,
                provider_payment_id: event.provider_payment_id,
                raw_status: event.raw_status,
            },
        )
        .await
    }

    /// Caller-initiated cancellation: only a pending, unshipped order may be
    /// cancelled, through the same compare-and-set discipline as every other
    /// transition. The stock reservation is returned on success.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = self.orders.get_order_required(order_id).await?;

        if order.shipped_at.is_some() {
            return Err(ServiceError::InvalidOperation(
                "Order has already shipped and can no longer be cancelled".to_string(),
            ));
        }

        let cancelled = self
            .orders
            .transition_status(
                order_id,
                OrderStatus::Pending,
                OrderStatus::Cancelled,
                CorrelationUpdate::default(),
            )
            .await?;

        if !cancelled {
            let current = self.orders.get_order_required(order_id).await?;
            return Err(ServiceError::InvalidOperation(format!(
                "Only pending orders can be cancelled (current status: {})",
                current.status
            )));
        }

        self.orders.restore_order_stock(order_id).await?;
        self.send_event(Event::OrderCancelled(order_id)).await;

        info!(order_id = %order_id, "Order cancelled");
        self.orders.get_order_required(order_id).await
    }

    // Shared transition tail for verify, webhook and poll paths.
    async fn apply_verification(
        &self,
        order: order::Model,
        verification: GatewayVerification,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let target = PaymentVerifier::determine_status(&verification);

        if target == OrderStatus::Pending {
            // Provider has not settled yet; nothing to apply.
            return Ok(PaymentStatusResponse {
                success: false,
                order_id: order.id,
                status: OrderStatus::Pending,
                gateway: order.gateway,
                already_processed: false,
            });
        }

        let won = self
            .orders
            .transition_status(
                order.id,
                OrderStatus::Pending,
                target,
                CorrelationUpdate {
                    provider_order_id: verification.provider_order_id.clone(),
                    provider_payment_id: verification.provider_payment_id.clone(),
                },
            )
            .await?;

        if !won {
            // A concurrent verification or webhook applied the transition
            // first; report whatever it decided.
            let current = self.orders.get_order_required(order.id).await?;
            let status = order_status(&current)?;
            return Ok(PaymentStatusResponse {
                success: status == OrderStatus::Paid,
                order_id: current.id,
                status,
                gateway: current.gateway,
                already_processed: true,
            });
        }

        info!(
            order_id = %order.id,
            raw_status = %verification.raw_status,
            new_status = %target,
            "Payment state applied"
        );

        self.send_event(Event::OrderStatusChanged {
            order_id: order.id,
            old_status: OrderStatus::Pending.as_str().to_string(),
            new_status: target.as_str().to_string(),
        })
        .await;

        match target {
            OrderStatus::Paid => {
                self.send_event(Event::PaymentSucceeded {
                    order_id: order.id,
                    gateway: order.gateway.clone(),
                    provider_payment_id: verification.provider_payment_id,
                })
                .await;

                // Best effort: a cart-clear failure must never undo payment
                // state.
                match self.carts.clear_cart(order.user_id).await {
                    Ok(()) => self.send_event(Event::CartCleared(order.user_id)).await,
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "Cart clear failed after payment")
                    }
                }
            }
            _ => {
                self.send_event(Event::PaymentFailed {
                    order_id: order.id,
                    gateway: order.gateway.clone(),
                    reason: verification.raw_status,
                })
                .await;
            }
        }

        Ok(PaymentStatusResponse {
            success: target == OrderStatus::Paid,
            order_id: order.id,
            status: target,
            gateway: order.gateway,
            already_processed: false,
        })
    }

    /// The idempotency guard: a terminal order resolves duplicate callbacks
    /// to the already-decided result without touching the gateway.
    fn short_circuit_terminal(
        &self,
        order: &order::Model,
    ) -> Result<Option<PaymentStatusResponse>, ServiceError> {
        let status = order_status(order)?;
        if !status.is_terminal() {
            return Ok(None);
        }

        Ok(Some(PaymentStatusResponse {
            success: status == OrderStatus::Paid,
            order_id: order.id,
            status,
            gateway: order.gateway.clone(),
            already_processed: true,
        }))
    }

    // Gateway failure after the commit: mark failed, then apply the stock
    // compensation policy. Only the CAS winner compensates, so a racing
    // webhook can never double-restore.
    async fn fail_after_commit(
        &self,
        order: &order::Model,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let won = self
            .orders
            .transition_status(
                order.id,
                OrderStatus::Pending,
                OrderStatus::Failed,
                CorrelationUpdate::default(),
            )
            .await?;

        if won {
            if self.config.restock_on_gateway_failure {
                self.orders.restore_order_stock(order.id).await?;
            }
            self.send_event(Event::PaymentFailed {
                order_id: order.id,
                gateway: order.gateway.clone(),
                reason: reason.to_string(),
            })
            .await;
        }

        Ok(())
    }

    async fn resolve_webhook_order(
        &self,
        event: &crate::webhooks::WebhookEvent,
    ) -> Result<order::Model, ServiceError> {
        if let Some(provider_order_id) = &event.provider_order_id {
            if let Some(order) = self
                .orders
                .find_by_provider_order_id(provider_order_id)
                .await?
            {
                return Ok(order);
            }
        }

        if let Some(merchant_tx_id) = &event.merchant_tx_id {
            if let Some(order) = self.orders.find_by_merchant_tx_id(merchant_tx_id).await? {
                return Ok(order);
            }
        }

        Err(ServiceError::NotFound(
            "Webhook does not correlate with any order".to_string(),
        ))
    }

    async fn load_products(
        &self,
        items: &[CartLine],
    ) -> Result<HashMap<Uuid, product::Model>, ServiceError> {
        let ids: Vec<Uuid> = items.iter().map(|line| line.product_id).collect();

        let products: HashMap<Uuid, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut unknown = Vec::new();
        for line in items {
            match products.get(&line.product_id) {
                None => unknown.push(format!("product {} does not exist", line.product_id)),
                Some(p) if !p.is_active => {
                    unknown.push(format!("product {} is no longer sold", line.product_id))
                }
                Some(_) => {}
            }
        }

        if unknown.is_empty() {
            Ok(products)
        } else {
            Err(ServiceError::ValidationError(unknown.join("; ")))
        }
    }

    async fn send_event(&self, event: Event) {
        if let Some(sender) = &self.events {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send event");
            }
        }
    }
}

fn order_status(order: &order::Model) -> Result<OrderStatus, ServiceError> {
    order.order_status().ok_or_else(|| {
        ServiceError::InternalError(format!(
            "Order {} carries unknown status '{}'",
            order.id, order.status
        ))
    })
}

/// Integer total and frozen line items. Sale price wins over regular price;
/// all arithmetic is checked so a hostile quantity cannot wrap the total.
fn build_order_items(
    lines: &[CartLine],
    products: &HashMap<Uuid, product::Model>,
) -> Result<(i64, Vec<NewOrderItem>), ServiceError> {
    let mut total: i64 = 0;
    let mut items = Vec::with_capacity(lines.len());

    for line in lines {
        let product = products.get(&line.product_id).ok_or_else(|| {
            ServiceError::InternalError("Product disappeared between validation and pricing".into())
        })?;

        let unit_price = product.effective_price();
        let line_total = unit_price
            .checked_mul(i64::from(line.quantity))
            .ok_or_else(|| ServiceError::ValidationError("Order total overflows".into()))?;
        total = total
            .checked_add(line_total)
            .ok_or_else(|| ServiceError::ValidationError("Order total overflows".into()))?;

        items.push(NewOrderItem {
            product_id: product.id,
            name: product.name.clone(),
            description: product.description.clone(),
            quantity: line.quantity,
            unit_price,
        });
    }

    Ok((total, items))
}

fn generate_merchant_tx_id() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = Uuid::new_v4().simple().to_string()[..12].to_uppercase();
    format!("TXN-{date}-{suffix}")
}

fn generate_order_number() -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("ORD-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(price: i64, sale_price: Option<i64>) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            name: "Filter Coffee 500g".into(),
            description: Some("Fresh ground".into()),
            sku: "COF-500".into(),
            price,
            sale_price,
            stock: 10,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn total_sums_unit_price_times_quantity() {
        let first = product(5000, None);
        let second = product(3000, None);
        let products: HashMap<Uuid, product::Model> =
            [(first.id, first.clone()), (second.id, second.clone())].into();

        let lines = vec![
            CartLine {
                product_id: first.id,
                quantity: 2,
            },
            CartLine {
                product_id: second.id,
                quantity: 1,
            },
        ];

        let (total, items) = build_order_items(&lines, &products).unwrap();
        assert_eq!(total, 13_000);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn sale_price_takes_precedence_in_totals() {
        let discounted = product(5000, Some(4000));
        let products: HashMap<Uuid, product::Model> = [(discounted.id, discounted.clone())].into();

        let lines = vec![CartLine {
            product_id: discounted.id,
            quantity: 3,
        }];

        let (total, items) = build_order_items(&lines, &products).unwrap();
        assert_eq!(total, 12_000);
        assert_eq!(items[0].unit_price, 4000);
    }

    #[test]
    fn overflowing_total_is_rejected() {
        let expensive = product(i64::MAX, None);
        let products: HashMap<Uuid, product::Model> = [(expensive.id, expensive.clone())].into();

        let lines = vec![CartLine {
            product_id: expensive.id,
            quantity: 2,
        }];

        assert!(build_order_items(&lines, &products).is_err());
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let tx_id = generate_merchant_tx_id();
        assert!(tx_id.starts_with("TXN-"));
        assert_eq!(tx_id.len(), "TXN-".len() + 8 + 1 + 12);

        let order_number = generate_order_number();
        assert!(order_number.starts_with("ORD-"));
    }
}
