use crate::{
    db::DbPool,
    entities::cart_item::{self, Entity as CartItemEntity},
    errors::ServiceError,
};
use async_trait::async_trait;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Cart collaborator boundary. The cart itself lives outside the checkout
/// core; all the core ever does is clear it after a successful payment.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError>;
}

/// Default implementation against the shared relational store.
pub struct SqlCartStore {
    db: Arc<DbPool>,
}

impl SqlCartStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CartStore for SqlCartStore {
    async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let result = CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await?;

        info!(user_id = %user_id, removed = result.rows_affected, "Cart cleared");
        Ok(())
    }
}
