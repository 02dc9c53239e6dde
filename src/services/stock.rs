use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::debug;
use uuid::Uuid;

/// Atomic per-product inventory movements.
///
/// The decrement is a single conditional update (`stock = stock - q WHERE
/// stock >= q`), so the read and the write happen under the same row guard
/// and concurrent checkouts can never jointly drive stock below zero. A plain
/// read-then-write here would be a race.
pub struct StockLedger;

impl StockLedger {
    /// Units currently on hand, or `None` for an unknown product.
    pub async fn available<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
    ) -> Result<Option<i32>, ServiceError> {
        let product = ProductEntity::find_by_id(product_id).one(conn).await?;
        Ok(product.map(|p| p.stock))
    }

    /// Decrements stock for one product, failing without side effects when
    /// fewer than `quantity` units remain. Runs inside the caller's
    /// transaction when given a transaction connection.
    pub async fn decrement<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InsufficientStock(format!(
                "product {product_id}: fewer than {quantity} units remain"
            )));
        }

        debug!(product_id = %product_id, quantity = quantity, "Stock decremented");
        Ok(())
    }

    /// Returns previously decremented units to the shelf (gateway-failure
    /// compensation and cancellation).
    pub async fn restore<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        debug!(product_id = %product_id, quantity = quantity, "Stock restored");
        Ok(())
    }
}
