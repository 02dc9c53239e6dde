//! Shared harness for integration tests: an isolated in-memory SQLite
//! database per test, schema bootstrapped from the entities, seed helpers and
//! a scripted gateway that stands in for a real payment provider.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use checkout_engine::{
    config::CheckoutConfig,
    db::DbPool,
    entities::{self, cart_item, order, product},
    errors::ServiceError,
    events::{self, Event},
    gateways::{
        CorrelationIds, GatewayVerification, OrderContext, PaymentGateway, PaymentGatewayFactory,
        PaymentInitiation, PaymentState,
    },
    services::carts::SqlCartStore,
    services::checkout::{CheckoutOrchestrator, CheckoutRequest},
    services::orders::OrderStore,
    services::validation::{CartLine, ShippingAddress},
    webhooks::WebhookEvent,
};
use hmac::{Hmac, Mac};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, EntityTrait,
    PaginatorTrait, QueryFilter, Schema, Set,
};
use serde_json::Value;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Scripted stand-in for a payment provider. Behaviour is toggled per test:
/// failing the create call, or fixing the result of a status poll.
pub struct ScriptedGateway {
    fail_create: AtomicBool,
    create_calls: AtomicUsize,
    status_calls: AtomicUsize,
    poll_result: Mutex<PaymentState>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            fail_create: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            poll_result: Mutex::new(PaymentState::Pending),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn set_poll_result(&self, state: PaymentState) {
        *self.poll_result.lock().unwrap() = state;
    }

    /// Signs a webhook body the way this fake provider would.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "testpay"
    }

    async fn create_payment_request(
        &self,
        ctx: &OrderContext,
    ) -> Result<PaymentInitiation, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError("Provider unavailable".into()));
        }

        Ok(PaymentInitiation {
            payment_url: Some(format!("https://pay.test/session/{}", ctx.merchant_tx_id)),
            provider_order_id: Some(format!("tp_order_{}", ctx.merchant_tx_id)),
            provider_payment_id: None,
        })
    }

    async fn verify_payment_response(
        &self,
        payload: &Value,
    ) -> Result<GatewayVerification, ServiceError> {
        let event = self.normalize_webhook(payload)?;
        Ok(GatewayVerification {
            state: event.state,
            provider_order_id: event.provider_order_id,
            provider_payment_id: event.provider_payment_id,
            raw_status: event.raw_status,
        })
    }

    async fn check_status(
        &self,
        correlation: &CorrelationIds,
    ) -> Result<GatewayVerification, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = *self.poll_result.lock().unwrap();

        Ok(GatewayVerification {
            state,
            provider_order_id: correlation.provider_order_id.clone(),
            provider_payment_id: match state {
                PaymentState::Succeeded => Some(format!("tp_pay_{}", correlation.merchant_tx_id)),
                _ => None,
            },
            raw_status: format!("{state:?}"),
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    fn normalize_webhook(&self, payload: &Value) -> Result<WebhookEvent, ServiceError> {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::ValidationError("missing status".into()))?;

        let state = match status {
            "success" => PaymentState::Succeeded,
            "pending" => PaymentState::Pending,
            _ => PaymentState::Failed,
        };

        Ok(WebhookEvent {
            state,
            merchant_tx_id: payload
                .get("merchant_tx_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            provider_order_id: payload
                .get("provider_order_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            provider_payment_id: payload
                .get("payment_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw_status: status.to_string(),
        })
    }
}

/// One isolated application stack per test.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub orders: OrderStore,
    pub gateway: Arc<ScriptedGateway>,
    pub checkout: CheckoutOrchestrator,
    pub events: mpsc::Receiver<Event>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_checkout_config()).await
    }

    pub async fn with_config(config: CheckoutConfig) -> Self {
        let db = Arc::new(fresh_database().await);

        let gateway = Arc::new(ScriptedGateway::new());
        let factory = Arc::new(
            PaymentGatewayFactory::new("testpay").register(gateway.clone() as Arc<dyn PaymentGateway>),
        );

        let (event_sender, events) = events::channel(256);
        let orders = OrderStore::new(db.clone());
        let checkout = CheckoutOrchestrator::new(
            db.clone(),
            orders.clone(),
            factory,
            Arc::new(SqlCartStore::new(db.clone())),
            Some(Arc::new(event_sender)),
            config,
        );

        Self {
            db,
            orders,
            gateway,
            checkout,
            events,
        }
    }

    /// Builds an orchestrator over the same database with a custom factory
    /// (used to exercise the real provider gateways offline).
    pub fn orchestrator_with_factory(
        &self,
        factory: Arc<PaymentGatewayFactory>,
        config: CheckoutConfig,
    ) -> CheckoutOrchestrator {
        CheckoutOrchestrator::new(
            self.db.clone(),
            self.orders.clone(),
            factory,
            Arc::new(SqlCartStore::new(self.db.clone())),
            None,
            config,
        )
    }

    /// Builds an orchestrator over the same database and scripted gateway but
    /// with a custom cart collaborator.
    pub fn orchestrator_with_carts(
        &self,
        carts: Arc<dyn checkout_engine::services::carts::CartStore>,
    ) -> CheckoutOrchestrator {
        let factory = Arc::new(
            PaymentGatewayFactory::new("testpay")
                .register(self.gateway.clone() as Arc<dyn PaymentGateway>),
        );
        CheckoutOrchestrator::new(
            self.db.clone(),
            self.orders.clone(),
            factory,
            carts,
            None,
            test_checkout_config(),
        )
    }

    pub async fn seed_product(&self, price: i64, sale_price: Option<i64>, stock: i32) -> product::Model {
        let suffix = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Test Product {suffix}")),
            description: Set(Some("Integration test product".into())),
            sku: Set(format!("SKU-{suffix}")),
            price: Set(price),
            sale_price: Set(sale_price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("failed to seed product")
    }

    pub async fn seed_cart_item(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("failed to seed cart item");
    }

    pub async fn cart_count(&self, user_id: Uuid) -> u64 {
        entities::CartItem::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .count(&*self.db)
            .await
            .expect("failed to count cart items")
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        self.orders
            .get_order(order_id)
            .await
            .expect("failed to load order")
            .expect("order missing")
    }

    pub async fn product_stock(&self, product_id: Uuid) -> i32 {
        entities::Product::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("failed to load product")
            .expect("product missing")
            .stock
    }
}

pub fn test_checkout_config() -> CheckoutConfig {
    CheckoutConfig {
        default_gateway: "testpay".into(),
        currency: "INR".into(),
        restock_on_gateway_failure: true,
        gateway_timeout_secs: 2,
    }
}

pub fn checkout_request(lines: Vec<CartLine>) -> CheckoutRequest {
    CheckoutRequest {
        items: lines,
        address: shipping_address(),
        notes: None,
    }
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        recipient: "Asha Rao".into(),
        street: "14 MG Road".into(),
        city: "Bengaluru".into(),
        state: Some("KA".into()),
        postal_code: Some("560001".into()),
        phone: Some("+91-9800000000".into()),
        email: Some("asha@example.test".into()),
    }
}

/// Fresh in-memory SQLite with the schema created from the entities. A single
/// pooled connection keeps every handle on the same memory database.
async fn fresh_database() -> DbPool {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).min_connections(1).sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .expect("failed to open in-memory database");

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let statements = [
        schema.create_table_from_entity(entities::Product),
        schema.create_table_from_entity(entities::Order),
        schema.create_table_from_entity(entities::OrderItem),
        schema.create_table_from_entity(entities::CartItem),
    ];
    for statement in statements {
        db.execute(backend.build(&statement))
            .await
            .expect("failed to create schema");
    }

    db
}
