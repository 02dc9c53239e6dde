use crate::errors::ServiceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// One requested line of a checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Shipping address as submitted by the caller. Persisted on the order as a
/// JSON snapshot, never as a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub recipient: String,
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Pure validation over cart lines, addresses and stock levels.
///
/// Every check aggregates all problems before reporting, so a customer sees
/// the full list at once instead of fixing one field per round trip. Expected
/// invalid input is always a structured error, never a panic.
pub struct OrderValidator;

impl OrderValidator {
    pub fn validate_cart_items(items: &[CartLine]) -> Result<(), ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Cart contains no items".to_string(),
            ));
        }

        let mut problems = Vec::new();
        for (index, line) in items.iter().enumerate() {
            if line.product_id.is_nil() {
                problems.push(format!("item {}: missing product reference", index + 1));
            }
            if line.quantity <= 0 {
                problems.push(format!(
                    "item {}: quantity must be positive (got {})",
                    index + 1,
                    line.quantity
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ValidationError(problems.join("; ")))
        }
    }

    pub fn validate_shipping_address(address: &ShippingAddress) -> Result<(), ServiceError> {
        let mut missing = Vec::new();

        if address.recipient.trim().is_empty() {
            missing.push("recipient");
        }
        if address.street.trim().is_empty() {
            missing.push("street");
        }
        if address.city.trim().is_empty() {
            missing.push("city");
        }

        let has_contact = address
            .phone
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
            || address
                .email
                .as_deref()
                .map(|e| !e.trim().is_empty())
                .unwrap_or(false);
        if !has_contact {
            missing.push("phone or email");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ValidationError(format!(
                "Shipping address is missing: {}",
                missing.join(", ")
            )))
        }
    }

    /// Checks requested quantities against an injected stock lookup.
    ///
    /// The lookup returns `None` for products that no longer exist. All
    /// shortfalls are collected into a single report rather than failing on
    /// the first one.
    pub async fn validate_stock_availability<F, Fut>(
        items: &[CartLine],
        stock_lookup: F,
    ) -> Result<(), ServiceError>
    where
        F: Fn(Uuid) -> Fut,
        Fut: Future<Output = Result<Option<i32>, ServiceError>>,
    {
        let mut shortfalls = Vec::new();

        for line in items {
            match stock_lookup(line.product_id).await? {
                None => shortfalls.push(format!("product {}: no longer available", line.product_id)),
                Some(available) if available < line.quantity => shortfalls.push(format!(
                    "product {}: requested {}, available {}",
                    line.product_id, line.quantity, available
                )),
                Some(_) => {}
            }
        }

        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::InsufficientStock(shortfalls.join("; ")))
        }
    }
}
