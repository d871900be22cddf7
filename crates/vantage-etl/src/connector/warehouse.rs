//! Spreadsheet uploads are stored as warehouse tables; reading them needs no
//! external connection.

use std::sync::Arc;

use async_trait::async_trait;
use vantage_db::{RowSet, ScalarValue, Warehouse};
use vantage_secrets::Secret;

use super::{ConnectionDescriptor, Connector, ConnectorError, Session};

pub struct WarehouseConnector {
    warehouse: Arc<dyn Warehouse>,
}

impl WarehouseConnector {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl Connector for WarehouseConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        _password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError> {
        Ok(Box::new(WarehouseSession {
            warehouse: Arc::clone(&self.warehouse),
        }))
    }
}

struct WarehouseSession {
    warehouse: Arc<dyn Warehouse>,
}

#[async_trait]
impl Session for WarehouseSession {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError> {
        self.warehouse
            .query(sql, params)
            .await
            .map_err(|err| ConnectorError::QueryError(err.to_string()))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Dialect;
    use vantage_db::{ColumnSpec, ColumnType, MemoryWarehouse};

    #[tokio::test]
    async fn reads_uploaded_tables_from_the_warehouse() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse
            .insert_table(
                "uploads.budget",
                vec![ColumnSpec::new("item", ColumnType::Text)],
                vec![vec![ScalarValue::Text("rent".into())]],
            )
            .unwrap();

        let connector = WarehouseConnector::new(warehouse);
        let descriptor = ConnectionDescriptor {
            id: "budget-xlsx".into(),
            dialect: Dialect::Excel,
            host: String::new(),
            port: None,
            database: String::new(),
            user: String::new(),
            encrypted_password: None,
            tenant_id: None,
            owner_id: None,
        };
        let mut session = connector.connect(&descriptor, None).await.unwrap();
        let rows = session
            .query("SELECT * FROM \"uploads\".\"budget\"", &[])
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["item".to_string()]);
        assert_eq!(rows.len(), 1);
        session.disconnect().await.unwrap();
    }
}
