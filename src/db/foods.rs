use async_trait::async_trait;
use sqlx::PgPool;

use crate::{models::food::Food, store::FoodCatalog};

pub struct PgFoodCatalog {
    pool: PgPool,
}

impl PgFoodCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FoodCatalog for PgFoodCatalog {
    async fn find(&self, ids: &[i32]) -> anyhow::Result<Vec<Food>> {
        let foods = sqlx::query_as::<_, Food>("SELECT id, name FROM foods WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(foods)
    }
}
