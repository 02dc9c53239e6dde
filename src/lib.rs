//! Checkout Engine
//!
//! Order-checkout and payment-settlement core for an online store: cart
//! validation, the atomic order + stock commit, hand-off to interchangeable
//! payment gateways, and reconciliation of the final order state from
//! redirects, webhooks or status polls. The HTTP layer consuming this crate
//! lives elsewhere.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod logging;
pub mod services;
pub mod webhooks;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::gateways::{phonepe::PhonePeGateway, razorpay::RazorpayGateway, PaymentGatewayFactory};
use crate::services::carts::SqlCartStore;
use crate::services::checkout::CheckoutOrchestrator;
use crate::services::orders::OrderStore;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub orders: OrderStore,
    pub checkout: Arc<CheckoutOrchestrator>,
}

impl AppState {
    /// Wires the full checkout stack from configuration: gateway variants,
    /// the factory with the configured default, the SQL-backed cart
    /// collaborator and the orchestrator.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(config.checkout.gateway_timeout_secs);

        let gateways = Arc::new(
            PaymentGatewayFactory::new(config.checkout.default_gateway.clone())
                .register(Arc::new(PhonePeGateway::new(config.phonepe.clone(), timeout)))
                .register(Arc::new(RazorpayGateway::new(
                    config.razorpay.clone(),
                    timeout,
                ))),
        );

        // Fails fast when the configured default names an unknown gateway.
        gateways.default_gateway()?;

        let orders = OrderStore::new(db.clone());
        let checkout = Arc::new(CheckoutOrchestrator::new(
            db.clone(),
            orders.clone(),
            gateways,
            Arc::new(SqlCartStore::new(db.clone())),
            event_sender,
            config.checkout.clone(),
        ));

        Ok(Self {
            db,
            config,
            orders,
            checkout,
        })
    }
}
