//! Hosted-page redirect gateway.
//!
//! The provider takes a base64-encoded order envelope, returns a hosted
//! payment page URL, and settles asynchronously through a signed
//! server-to-server callback. Every request and callback is authenticated
//! with a salted SHA-256 checksum carried in the `X-VERIFY` header.

use crate::config::PhonePeConfig;
use crate::errors::ServiceError;
use crate::gateways::{
    CorrelationIds, GatewayVerification, OrderContext, PaymentGateway, PaymentInitiation,
    PaymentState,
};
use crate::webhooks::{self, WebhookEvent};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{instrument, warn};

pub const GATEWAY_NAME: &str = "phonepe";

const PAY_ENDPOINT: &str = "/pg/v1/pay";

#[derive(Debug, Deserialize)]
struct PayResponse {
    success: bool,
    code: String,
    data: Option<PayData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayData {
    transaction_id: Option<String>,
    instrument_response: Option<InstrumentResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentResponse {
    redirect_info: Option<RedirectInfo>,
}

#[derive(Debug, Deserialize)]
struct RedirectInfo {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    code: String,
    data: Option<StatusData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusData {
    transaction_id: Option<String>,
}

pub struct PhonePeGateway {
    config: PhonePeConfig,
    client: reqwest::Client,
}

impl PhonePeGateway {
    pub fn new(config: PhonePeConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap();
        Self { config, client }
    }

    /// Salted checksum in the provider's `X-VERIFY` format:
    /// `hex(sha256(payload || salt_key)) + "###" + salt_index`.
    fn checksum(&self, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.update(self.config.salt_key.as_bytes());
        format!("{}###{}", hex::encode(hasher.finalize()), self.config.salt_index)
    }

    fn map_code(code: &str) -> PaymentState {
        match code {
            "PAYMENT_SUCCESS" | "COMPLETED" => PaymentState::Succeeded,
            "PAYMENT_PENDING" | "PENDING" => PaymentState::Pending,
            _ => PaymentState::Failed,
        }
    }
}

#[async_trait]
impl PaymentGateway for PhonePeGateway {
    fn name(&self) -> &'static str {
        GATEWAY_NAME
    }

    #[instrument(skip(self, ctx), fields(merchant_tx_id = %ctx.merchant_tx_id))]
    async fn create_payment_request(
        &self,
        ctx: &OrderContext,
    ) -> Result<PaymentInitiation, ServiceError> {
        let envelope = json!({
            "merchantId": self.config.merchant_id,
            "merchantTransactionId": ctx.merchant_tx_id,
            "merchantUserId": ctx.user_id.to_string(),
            "amount": ctx.amount,
            "redirectUrl": self.config.redirect_url,
            "redirectMode": "REDIRECT",
            "callbackUrl": self.config.callback_url,
            "paymentInstrument": { "type": "PAY_PAGE" },
        });

        let encoded = BASE64.encode(
            serde_json::to_vec(&envelope)
                .map_err(|e| ServiceError::SerializationError(e.to_string()))?,
        );

        let mut signed = encoded.clone().into_bytes();
        signed.extend_from_slice(PAY_ENDPOINT.as_bytes());
        let x_verify = self.checksum(&signed);

        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, PAY_ENDPOINT))
            .header("X-VERIFY", x_verify)
            .json(&json!({ "request": encoded }))
            .send()
            .await
            .map_err(gateway_error)?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayError(format!(
                "Payment initiation returned HTTP {}",
                response.status()
            )));
        }

        let body: PayResponse = response.json().await.map_err(gateway_error)?;

        if !body.success {
            return Err(ServiceError::GatewayError(format!(
                "Payment initiation rejected: {}",
                body.code
            )));
        }

        let data = body.data.ok_or_else(|| {
            ServiceError::GatewayError("Payment initiation response carried no data".into())
        })?;

        let payment_url = data
            .instrument_response
            .and_then(|ir| ir.redirect_info)
            .map(|ri| ri.url)
            .ok_or_else(|| {
                ServiceError::GatewayError("Payment initiation response carried no redirect URL".into())
            })?;

        Ok(PaymentInitiation {
            payment_url: Some(payment_url),
            provider_order_id: None,
            provider_payment_id: data.transaction_id,
        })
    }

    async fn verify_payment_response(
        &self,
        payload: &Value,
    ) -> Result<GatewayVerification, ServiceError> {
        let event = webhooks::normalize_phonepe(payload)?;
        Ok(GatewayVerification {
            state: event.state,
            provider_order_id: None,
            provider_payment_id: event.provider_payment_id,
            raw_status: event.raw_status,
        })
    }

    #[instrument(skip(self, correlation), fields(merchant_tx_id = %correlation.merchant_tx_id))]
    async fn check_status(
        &self,
        correlation: &CorrelationIds,
    ) -> Result<GatewayVerification, ServiceError> {
        let path = format!(
            "/pg/v1/status/{}/{}",
            self.config.merchant_id, correlation.merchant_tx_id
        );
        let x_verify = self.checksum(path.as_bytes());

        let response = self
            .client
            .get(format!("{}{}", self.config.base_url, path))
            .header("X-VERIFY", x_verify)
            .header("X-MERCHANT-ID", &self.config.merchant_id)
            .send()
            .await
            .map_err(gateway_error)?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayError(format!(
                "Status check returned HTTP {}",
                response.status()
            )));
        }

        let body: StatusResponse = response.json().await.map_err(gateway_error)?;
        let state = Self::map_code(&body.code);

        if state == PaymentState::Pending {
            warn!(code = %body.code, "Payment still pending at provider");
        }

        Ok(GatewayVerification {
            state,
            provider_order_id: None,
            provider_payment_id: body.data.and_then(|d| d.transaction_id),
            raw_status: body.code,
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        self.checksum(raw_body) == signature
    }

    fn normalize_webhook(&self, payload: &Value) -> Result<WebhookEvent, ServiceError> {
        webhooks::normalize_phonepe(payload)
    }
}

fn gateway_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::GatewayError("Provider call timed out".into())
    } else {
        ServiceError::GatewayError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> PhonePeGateway {
        PhonePeGateway::new(
            PhonePeConfig {
                merchant_id: "M_TEST".into(),
                salt_key: "unit-test-salt".into(),
                salt_index: 1,
                base_url: "https://api-preprod.example.test".into(),
                redirect_url: "https://shop.example.test/payment/return".into(),
                callback_url: "https://shop.example.test/webhooks/phonepe".into(),
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn checksum_carries_salt_index_suffix() {
        let gateway = test_gateway();
        let checksum = gateway.checksum(b"payload");
        assert!(checksum.ends_with("###1"));
        assert_eq!(checksum.len(), 64 + 4); // sha256 hex + "###1"
    }

    #[test]
    fn webhook_signature_accepts_matching_checksum() {
        let gateway = test_gateway();
        let body = br#"{"code":"PAYMENT_SUCCESS"}"#;
        let signature = gateway.checksum(body);
        assert!(gateway.verify_webhook_signature(body, &signature));
    }

    #[test]
    fn webhook_signature_rejects_tampered_body() {
        let gateway = test_gateway();
        let signature = gateway.checksum(br#"{"code":"PAYMENT_ERROR"}"#);
        assert!(!gateway.verify_webhook_signature(br#"{"code":"PAYMENT_SUCCESS"}"#, &signature));
    }

    #[tokio::test]
    async fn verify_payment_response_maps_success_code() {
        let gateway = test_gateway();
        let payload = serde_json::json!({
            "code": "PAYMENT_SUCCESS",
            "data": { "merchantTransactionId": "TXN-1", "transactionId": "T1" }
        });

        let verification = gateway.verify_payment_response(&payload).await.unwrap();
        assert_eq!(verification.state, PaymentState::Succeeded);
        assert_eq!(verification.provider_payment_id.as_deref(), Some("T1"));
    }
}
