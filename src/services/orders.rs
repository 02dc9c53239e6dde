use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    gateways::PaymentInitiation,
    services::stock::StockLedger,
    services::validation::ShippingAddress,
};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Order fields prepared by the orchestrator before the commit.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub order_number: String,
    pub merchant_tx_id: String,
    pub gateway: String,
    pub currency: String,
    pub total_amount: i64,
    pub shipping_address: ShippingAddress,
    pub notes: Option<String>,
}

/// Line-item snapshot taken from the catalog at checkout time.
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
}

/// Correlation identifiers captured during verification.
#[derive(Debug, Clone, Default)]
pub struct CorrelationUpdate {
    pub provider_order_id: Option<String>,
    pub provider_payment_id: Option<String>,
}

/// Persistence for orders and their items.
///
/// Owns the one commit boundary that includes the stock decrement, and the
/// compare-and-set status transition every later state change goes through.
#[derive(Clone)]
pub struct OrderStore {
    db: Arc<DbPool>,
}

impl OrderStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Transaction boundary A: creates the order, all of its items, and the
    /// stock decrement for every item as one atomic unit. Any failure rolls
    /// the whole transaction back; no partial order is ever visible.
    #[instrument(skip(self, new_order, items), fields(order_number = %new_order.order_number))]
    pub async fn create_order_with_items(
        &self,
        new_order: NewOrder,
        items: &[NewOrderItem],
    ) -> Result<order::Model, ServiceError> {
        let address_snapshot = serde_json::to_string(&new_order.shipping_address)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;

        let txn = self.db.begin().await?;

        let order_id = Uuid::new_v4();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(new_order.user_id),
            order_number: Set(new_order.order_number.clone()),
            status: Set(OrderStatus::Pending.as_str().to_string()),
            total_amount: Set(new_order.total_amount),
            currency: Set(new_order.currency.clone()),
            gateway: Set(new_order.gateway.clone()),
            merchant_tx_id: Set(new_order.merchant_tx_id.clone()),
            provider_order_id: Set(None),
            provider_payment_id: Set(None),
            shipping_address: Set(address_snapshot),
            notes: Set(new_order.notes.clone()),
            shipped_at: Set(None),
            ..Default::default()
        };

        let order = order_model.insert(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order");
            ServiceError::DatabaseError(e)
        })?;

        for item in items {
            let item_model = order_item::ActiveModel {
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                name: Set(item.name.clone()),
                description: Set(item.description.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                ..Default::default()
            };
            item_model.insert(&txn).await?;

            StockLedger::decrement(&txn, item.product_id, item.quantity).await?;
        }

        txn.commit().await?;

        info!(order_id = %order_id, user_id = %new_order.user_id, "Order committed with stock reservation");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn get_order_required(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    pub async fn find_by_merchant_tx_id(
        &self,
        merchant_tx_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::MerchantTxId.eq(merchant_tx_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_provider_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::ProviderOrderId.eq(provider_order_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn load_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }

    /// Lists a user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_user_orders(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let paginator = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok((orders, total))
    }

    /// Compare-and-set status transition: the status write is conditioned on
    /// the row still holding `from`, in one statement. Returns `false` when a
    /// concurrent caller won the transition first; the caller then re-reads
    /// the row and reports the winner's result.
    #[instrument(skip(self, correlation), fields(order_id = %order_id, from = %from, to = %to))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        correlation: CorrelationUpdate,
    ) -> Result<bool, ServiceError> {
        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(to.as_str()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(from.as_str()));

        if let Some(provider_order_id) = correlation.provider_order_id {
            update = update.col_expr(
                order::Column::ProviderOrderId,
                Expr::value(provider_order_id),
            );
        }
        if let Some(provider_payment_id) = correlation.provider_payment_id {
            update = update.col_expr(
                order::Column::ProviderPaymentId,
                Expr::value(provider_payment_id),
            );
        }

        let result = update.exec(&*self.db).await?;
        Ok(result.rows_affected == 1)
    }

    /// Persists the correlation ids returned by a successful payment
    /// initiation. Status is untouched; a webhook may already have landed.
    pub async fn set_provider_ids(
        &self,
        order_id: Uuid,
        initiation: &PaymentInitiation,
    ) -> Result<(), ServiceError> {
        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id));

        if let Some(provider_order_id) = &initiation.provider_order_id {
            update = update.col_expr(
                order::Column::ProviderOrderId,
                Expr::value(provider_order_id.clone()),
            );
        }
        if let Some(provider_payment_id) = &initiation.provider_payment_id {
            update = update.col_expr(
                order::Column::ProviderPaymentId,
                Expr::value(provider_payment_id.clone()),
            );
        }

        update.exec(&*self.db).await?;
        Ok(())
    }

    /// Fulfilment hook: records the shipment time for a paid order. Shipped
    /// orders can no longer be cancelled.
    pub async fn mark_shipped(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::ShippedAt, Expr::value(Utc::now()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Paid.as_str()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Returns every unit this order decremented back to the shelf. Used by
    /// the gateway-failure compensation path and by cancellation, always
    /// after the caller has won the corresponding status transition.
    pub async fn restore_order_stock(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let items = self.load_items(order_id).await?;

        let txn = self.db.begin().await?;
        for item in &items {
            StockLedger::restore(&txn, item.product_id, item.quantity).await?;
        }
        txn.commit().await?;

        info!(order_id = %order_id, items = items.len(), "Order stock restored");
        Ok(())
    }
}
