//! Payment gateway abstraction.
//!
//! Each provider implements [`PaymentGateway`]; the orchestrator resolves a
//! variant once through [`PaymentGatewayFactory`] and never branches on
//! provider identity afterwards. Provider-specific payload shapes stay inside
//! the implementations and the webhook normalizers.

use crate::errors::ServiceError;
use crate::webhooks::WebhookEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod phonepe;
pub mod razorpay;

/// Everything a gateway needs to start a payment for a committed order.
#[derive(Debug, Clone)]
pub struct OrderContext {
    pub order_id: Uuid,
    pub user_id: Uuid,
    /// Process-generated idempotency key, already persisted on the order.
    pub merchant_tx_id: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub currency: String,
}

/// Correlation identifiers stored on an order. Which field a gateway uses for
/// status polling is the gateway's business, not the orchestrator's.
#[derive(Debug, Clone, Default)]
pub struct CorrelationIds {
    pub merchant_tx_id: String,
    pub provider_order_id: Option<String>,
    pub provider_payment_id: Option<String>,
}

/// Result of the provider-specific "start payment" call.
#[derive(Debug, Clone, Default)]
pub struct PaymentInitiation {
    /// Hosted payment page, when the provider redirects the customer.
    pub payment_url: Option<String>,
    /// Provider-issued order id, when the provider creates one up front.
    pub provider_order_id: Option<String>,
    /// Provider-issued transaction id, when known this early.
    pub provider_payment_id: Option<String>,
}

/// Provider-agnostic payment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Succeeded,
    Failed,
    /// The provider has not settled the payment yet; no transition applies.
    Pending,
}

/// Normalized result of a verification or status call.
#[derive(Debug, Clone)]
pub struct GatewayVerification {
    pub state: PaymentState,
    pub provider_order_id: Option<String>,
    pub provider_payment_id: Option<String>,
    /// Provider's own status code, kept verbatim for logging.
    pub raw_status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Stable identifier stored on the order as the gateway discriminator.
    fn name(&self) -> &'static str;

    /// Issues the provider's "start payment" call. Side-effecting exactly
    /// once per call; the orchestrator never retries it automatically, and a
    /// timeout is treated as a failure.
    async fn create_payment_request(
        &self,
        ctx: &OrderContext,
    ) -> Result<PaymentInitiation, ServiceError>;

    /// Confirms a payment from the parameters the provider hands back on the
    /// customer redirect.
    async fn verify_payment_response(
        &self,
        payload: &Value,
    ) -> Result<GatewayVerification, ServiceError>;

    /// Polls the provider for the current state of a payment attempt.
    async fn check_status(
        &self,
        correlation: &CorrelationIds,
    ) -> Result<GatewayVerification, ServiceError>;

    /// Checks the provider signature over the raw, unparsed body bytes. Must
    /// run before any JSON parsing; re-serialization can silently invalidate
    /// a signature.
    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool;

    /// Maps a parsed webhook payload to the provider-independent event shape
    /// using this provider's field-precedence rules.
    fn normalize_webhook(&self, payload: &Value) -> Result<WebhookEvent, ServiceError>;
}

/// Registry of gateway variants keyed by name, with a configured default.
pub struct PaymentGatewayFactory {
    gateways: HashMap<&'static str, Arc<dyn PaymentGateway>>,
    default_gateway: String,
}

impl PaymentGatewayFactory {
    pub fn new(default_gateway: impl Into<String>) -> Self {
        Self {
            gateways: HashMap::new(),
            default_gateway: default_gateway.into(),
        }
    }

    pub fn register(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.name(), gateway);
        self
    }

    /// Resolves a gateway by its stored name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::ValidationError(format!("Unknown payment gateway: {name}")))
    }

    /// Resolves the configured default gateway.
    pub fn default_gateway(&self) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways
            .get(self.default_gateway.as_str())
            .cloned()
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Default payment gateway '{}' is not registered",
                    self.default_gateway
                ))
            })
    }
}
