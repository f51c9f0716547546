//! PostgreSQL driver. Uses the simple-query protocol so results arrive as
//! text columns, matching the record-set contract.

use postgres::{Client, NoTls, SimpleQueryMessage};

use crate::driver::{DbConnection, Recordset};
use crate::error::{Result, StoreError};

pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    pub fn open(uri: &str) -> Result<Self> {
        let client =
            Client::connect(uri, NoTls).map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

impl DbConnection for PgConnection {
    fn exec(&mut self, sql: &str) -> Result<Recordset> {
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|e| StoreError::Sql(e.to_string()))?;
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Option<String>>> = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if columns.is_empty() {
                    columns = row
                        .columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                }
                rows.push(
                    (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect(),
                );
            }
        }
        Ok(Recordset::new(columns, rows))
    }

    fn connected(&mut self) -> bool {
        !self.client.is_closed()
    }
}
