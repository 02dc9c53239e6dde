//! Webhook payload normalization.
//!
//! Providers deliver the same logical event in more than one shape (fields at
//! the top level on older API versions, nested under a `data`/`payload`
//! object on newer ones). Each normalizer applies one explicit, ordered
//! field-precedence list at this boundary so no duck-typing leaks into the
//! orchestrator. Signature verification has already happened by the time a
//! payload reaches these functions.

use crate::errors::ServiceError;
use crate::gateways::PaymentState;
use serde_json::Value;

/// Provider-independent view of a webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub state: PaymentState,
    /// Merchant-side idempotency key, when the provider echoes it.
    pub merchant_tx_id: Option<String>,
    /// Provider-issued order id, when the provider uses that shape.
    pub provider_order_id: Option<String>,
    /// Provider-issued payment/transaction id.
    pub provider_payment_id: Option<String>,
    /// Provider status code verbatim, for logging.
    pub raw_status: String,
}

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

/// First non-null string among the given JSON pointers, in order.
fn first_str(value: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| str_field(value, p))
}

/// Normalizes a hosted-page callback.
///
/// Field precedence:
/// - status code: `code`, then `data/code`, then `data/state`
/// - merchant transaction id: `data/merchantTransactionId`, then
///   `merchantTransactionId`
/// - provider transaction id: `data/transactionId`, then `transactionId`
pub fn normalize_phonepe(payload: &Value) -> Result<WebhookEvent, ServiceError> {
    let code = first_str(payload, &["/code", "/data/code", "/data/state"]).ok_or_else(|| {
        ServiceError::ValidationError("Callback payload is missing a status code".into())
    })?;

    let merchant_tx_id = first_str(
        payload,
        &["/data/merchantTransactionId", "/merchantTransactionId"],
    )
    .ok_or_else(|| {
        ServiceError::ValidationError(
            "Callback payload is missing a merchant transaction id".into(),
        )
    })?;

    let provider_payment_id = first_str(payload, &["/data/transactionId", "/transactionId"]);

    let state = match code.as_str() {
        "PAYMENT_SUCCESS" | "COMPLETED" => PaymentState::Succeeded,
        "PAYMENT_PENDING" | "PENDING" => PaymentState::Pending,
        _ => PaymentState::Failed,
    };

    Ok(WebhookEvent {
        state,
        merchant_tx_id: Some(merchant_tx_id),
        provider_order_id: None,
        provider_payment_id,
        raw_status: code,
    })
}

/// Normalizes an order/signature provider event.
///
/// Field precedence:
/// - payment entity: `payload/payment/entity`, then `payment/entity`, then
///   `entity`
/// - event name: `event`, then the entity's `status`
pub fn normalize_razorpay(payload: &Value) -> Result<WebhookEvent, ServiceError> {
    let entity = ["/payload/payment/entity", "/payment/entity", "/entity"]
        .iter()
        .find_map(|p| payload.pointer(p))
        .ok_or_else(|| {
            ServiceError::ValidationError("Webhook payload is missing a payment entity".into())
        })?;

    let event = first_str(payload, &["/event"])
        .or_else(|| str_field(entity, "/status"))
        .ok_or_else(|| {
            ServiceError::ValidationError("Webhook payload is missing an event name".into())
        })?;

    let provider_payment_id = str_field(entity, "/id");
    let provider_order_id = str_field(entity, "/order_id");

    if provider_order_id.is_none() && provider_payment_id.is_none() {
        return Err(ServiceError::ValidationError(
            "Webhook payment entity carries no correlation id".into(),
        ));
    }

    let state = match event.as_str() {
        "payment.captured" | "order.paid" | "captured" => PaymentState::Succeeded,
        "payment.failed" | "failed" => PaymentState::Failed,
        _ => PaymentState::Pending,
    };

    Ok(WebhookEvent {
        state,
        // This provider always carries its own ids; orders are resolved by
        // provider order id, never by the merchant key.
        merchant_tx_id: None,
        provider_order_id,
        provider_payment_id,
        raw_status: event,
    })
}
