//! Order/signature gateway.
//!
//! The provider issues an order id up front; the client-side checkout hands
//! back `(order_id, payment_id, signature)` where the signature is an
//! HMAC-SHA256 over `order_id|payment_id`. Webhooks are signed with a
//! separate secret, HMAC-SHA256 over the raw body.

use crate::config::RazorpayConfig;
use crate::errors::ServiceError;
use crate::gateways::{
    CorrelationIds, GatewayVerification, OrderContext, PaymentGateway, PaymentInitiation,
    PaymentState,
};
use crate::webhooks::{self, WebhookEvent};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::instrument;

pub const GATEWAY_NAME: &str = "razorpay";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PaymentList {
    items: Vec<PaymentEntry>,
}

#[derive(Debug, Deserialize)]
struct PaymentEntry {
    id: String,
    status: String,
}

pub struct RazorpayGateway {
    config: RazorpayConfig,
    client: reqwest::Client,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap();
        Self { config, client }
    }

    /// Constant-time comparison of a hex-encoded HMAC-SHA256 signature.
    fn hmac_matches(secret: &str, message: &[u8], signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message);
        mac.verify_slice(&expected).is_ok()
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &'static str {
        GATEWAY_NAME
    }

    #[instrument(skip(self, ctx), fields(merchant_tx_id = %ctx.merchant_tx_id))]
    async fn create_payment_request(
        &self,
        ctx: &OrderContext,
    ) -> Result<PaymentInitiation, ServiceError> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.config.base_url))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&json!({
                "amount": ctx.amount,
                "currency": ctx.currency,
                "receipt": ctx.merchant_tx_id,
                "notes": { "order_id": ctx.order_id.to_string() },
            }))
            .send()
            .await
            .map_err(gateway_error)?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayError(format!(
                "Order creation returned HTTP {}",
                response.status()
            )));
        }

        let created: CreatedOrder = response.json().await.map_err(gateway_error)?;

        if created.status != "created" {
            return Err(ServiceError::GatewayError(format!(
                "Provider order arrived in unexpected state: {}",
                created.status
            )));
        }

        Ok(PaymentInitiation {
            payment_url: None,
            provider_order_id: Some(created.id),
            provider_payment_id: None,
        })
    }

    async fn verify_payment_response(
        &self,
        payload: &Value,
    ) -> Result<GatewayVerification, ServiceError> {
        let order_id = payload
            .get("razorpay_order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ValidationError("Payment response is missing razorpay_order_id".into())
            })?;
        let payment_id = payload
            .get("razorpay_payment_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ValidationError(
                    "Payment response is missing razorpay_payment_id".into(),
                )
            })?;
        let signature = payload
            .get("razorpay_signature")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ValidationError("Payment response is missing razorpay_signature".into())
            })?;

        let message = format!("{order_id}|{payment_id}");
        let valid = Self::hmac_matches(&self.config.key_secret, message.as_bytes(), signature);

        Ok(GatewayVerification {
            state: if valid {
                PaymentState::Succeeded
            } else {
                PaymentState::Failed
            },
            provider_order_id: Some(order_id.to_string()),
            provider_payment_id: Some(payment_id.to_string()),
            raw_status: if valid { "verified".into() } else { "signature_mismatch".into() },
        })
    }

    #[instrument(skip(self, correlation), fields(merchant_tx_id = %correlation.merchant_tx_id))]
    async fn check_status(
        &self,
        correlation: &CorrelationIds,
    ) -> Result<GatewayVerification, ServiceError> {
        let provider_order_id = correlation.provider_order_id.as_deref().ok_or_else(|| {
            ServiceError::ValidationError(
                "Order has no provider order id to poll status with".into(),
            )
        })?;

        let response = self
            .client
            .get(format!(
                "{}/v1/orders/{}/payments",
                self.config.base_url, provider_order_id
            ))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(gateway_error)?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayError(format!(
                "Status check returned HTTP {}",
                response.status()
            )));
        }

        let payments: PaymentList = response.json().await.map_err(gateway_error)?;

        if let Some(captured) = payments.items.iter().find(|p| p.status == "captured") {
            return Ok(GatewayVerification {
                state: PaymentState::Succeeded,
                provider_order_id: Some(provider_order_id.to_string()),
                provider_payment_id: Some(captured.id.clone()),
                raw_status: "captured".into(),
            });
        }

        if let Some(failed) = payments.items.iter().find(|p| p.status == "failed") {
            return Ok(GatewayVerification {
                state: PaymentState::Failed,
                provider_order_id: Some(provider_order_id.to_string()),
                provider_payment_id: Some(failed.id.clone()),
                raw_status: "failed".into(),
            });
        }

        Ok(GatewayVerification {
            state: PaymentState::Pending,
            provider_order_id: Some(provider_order_id.to_string()),
            provider_payment_id: None,
            raw_status: "pending".into(),
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        Self::hmac_matches(&self.config.webhook_secret, raw_body, signature)
    }

    fn normalize_webhook(&self, payload: &Value) -> Result<WebhookEvent, ServiceError> {
        webhooks::normalize_razorpay(payload)
    }
}

fn gateway_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::GatewayError("Provider call timed out".into())
    } else {
        ServiceError::GatewayError(e.to_string())
    }
}
