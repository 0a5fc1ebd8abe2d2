use std::sync::Arc;

use deadpool_postgres::{Object, Pool, Transaction};

use super::StoreError;

/// Checks a client out of the pool on first use and holds it afterwards,
/// so every attempt of a retried transaction runs on the same connection.
pub struct LazyConn {
    pool: Arc<Pool>,
    client: Option<Object>,
}

impl LazyConn {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool, client: None }
    }

    pub async fn get_client(&mut self) -> Result<&mut Object, StoreError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => self.pool.get().await?,
        };
        Ok(self.client.insert(client))
    }

    pub async fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        let client = self.get_client().await?;
        Ok(client.transaction().await?)
    }
}
