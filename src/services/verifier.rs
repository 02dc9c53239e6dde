use crate::entities::order::OrderStatus;
use crate::gateways::{GatewayVerification, PaymentState};

/// Maps a raw gateway verification result to an order status.
///
/// This is the single place a payment outcome becomes a status, independent
/// of which gateway produced it. A still-pending provider result maps back to
/// `Pending`, which callers treat as "no transition applies".
pub struct PaymentVerifier;

impl PaymentVerifier {
    pub fn determine_status(verification: &GatewayVerification) -> OrderStatus {
        match verification.state {
            PaymentState::Succeeded => OrderStatus::Paid,
            PaymentState::Failed => OrderStatus::Failed,
            PaymentState::Pending => OrderStatus::Pending,
        }
    }
}
