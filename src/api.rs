//! Table operations as exposed to RPC clients.

use crate::error::{DbError, ResourceType};
use crate::database::Database;
use crate::host::DbHost;
use crate::table::{Entry, ListOptions, Table};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on `limit` accepted from clients.
pub const MAX_LIST_LIMIT: usize = 1_000;

/// Error payload sent to RPC clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: String,
}

impl From<DbError> for RpcError {
    fn from(err: DbError) -> Self {
        let code = err.code();
        RpcError {
            code: code.rpc_code(),
            message: code.error_name().to_string(),
            data: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResponse {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResponse {
    pub key: String,
    pub url: String,
}

/// Keeps the typed range options and drops anything else a client sent.
pub fn sanitize_list_options(raw: &Value) -> ListOptions {
    let text = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_string);
    ListOptions {
        gt: text("gt"),
        gte: text("gte"),
        lt: text("lt"),
        lte: text("lte"),
        limit: raw
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).min(MAX_LIST_LIMIT)),
        reverse: raw.get("reverse").and_then(Value::as_bool).unwrap_or(false),
    }
}

pub struct TableApi {
    host: Arc<DbHost>,
}

impl TableApi {
    pub fn new(host: Arc<DbHost>) -> Self {
        Self { host }
    }

    fn table(&self, database_id: &str, schema_id: &str) -> Result<Arc<Table>, DbError> {
        self.host.get(database_id)?.get_table(schema_id)
    }

    fn db_table(
        &self,
        database_id: &str,
        schema_id: &str,
    ) -> Result<(Arc<Database>, Arc<Table>), DbError> {
        let db = self.host.get(database_id)?;
        let table = db.get_table(schema_id)?;
        Ok((db, table))
    }

    pub async fn list(
        &self,
        database_id: &str,
        schema_id: &str,
        opts: &Value,
    ) -> Result<ListResponse, RpcError> {
        let table = self.table(database_id, schema_id)?;
        let entries = table.list(&sanitize_list_options(opts)).await?;
        Ok(ListResponse { entries })
    }

    pub async fn get(
        &self,
        database_id: &str,
        schema_id: &str,
        key: &str,
    ) -> Result<Option<Entry>, RpcError> {
        let table = self.table(database_id, schema_id)?;
        Ok(table.get(key).await?)
    }

    pub async fn insert(
        &self,
        database_id: &str,
        schema_id: &str,
        value: Value,
    ) -> Result<WriteResponse, RpcError> {
        let (db, table) = self.db_table(database_id, schema_id)?;
        table.schema().assert_valid(&value)?;
        let key = table.schema().generate_key(&value)?;
        let entry = table.put(&key, value).await?;
        self.host.on_database_change(&db).await;
        Ok(WriteResponse {
            key: entry.key,
            url: entry.url,
        })
    }

    /// Replaces an existing entry; the key lock is held from the existence
    /// check through the index update.
    pub async fn update(
        &self,
        database_id: &str,
        schema_id: &str,
        key: &str,
        value: Value,
    ) -> Result<WriteResponse, RpcError> {
        let (db, table) = self.db_table(database_id, schema_id)?;
        let _guard = table.lock(key).await;
        if table.get(key).await?.is_none() {
            return Err(DbError::not_found(ResourceType::Entry, key).into());
        }
        let entry = table.put(key, value).await?;
        self.host.on_database_change(&db).await;
        Ok(WriteResponse {
            key: entry.key,
            url: entry.url,
        })
    }

    pub async fn del(&self, database_id: &str, schema_id: &str, key: &str) -> Result<(), RpcError> {
        let (db, table) = self.db_table(database_id, schema_id)?;
        let _guard = table.lock(key).await;
        table.del(key).await?;
        self.host.on_database_change(&db).await;
        Ok(())
    }
}
