use crate::BoxFuture;
use crate::database::Database;
use crate::error::DbError;
use crate::issues::{Issue, IssueTracker};
use crate::lib_helpers::now_micros;
use crate::schema::MethodSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct MethodContext<'a> {
    pub db: &'a Database,
    /// URL of the calling database or user, when known.
    pub caller: Option<&'a str>,
}

pub trait DbMethodHandler: Send + Sync {
    fn call<'a>(&'a self, cx: MethodContext<'a>, args: &'a Value)
    -> BoxFuture<'a, Result<Value, DbError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodResultCode {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMethodCall {
    pub method: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMethodResult {
    pub call_key: String,
    pub call_url: String,
    pub method: String,
    pub code: MethodResultCode,
    #[serde(default)]
    pub details: Value,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMethodResultChronIdx {
    pub chron_key: String,
    pub result_url: String,
}

/// A named mutation installed on a writable database.
pub struct DbMethod {
    method_id: String,
    schema: Arc<MethodSchema>,
    handler: Arc<dyn DbMethodHandler>,
    db_url: String,
}

impl DbMethod {
    pub(crate) fn new(
        schema: Arc<MethodSchema>,
        handler: Arc<dyn DbMethodHandler>,
        db_url: &str,
    ) -> Self {
        Self {
            method_id: schema.id.clone(),
            schema,
            handler,
            db_url: db_url.to_string(),
        }
    }

    pub fn method_id(&self) -> &str {
        &self.method_id
    }

    pub fn validate_call_args(&self, args: &Value) -> Result<(), DbError> {
        self.schema
            .validate_params(args)
            .map_err(|v| DbError::Validation(format!("{}: {v}", self.method_id)))
    }

    /// Records an issue when `result` breaks the response schema; never
    /// fails the call.
    pub fn validate_response(&self, result: &Value, issues: &IssueTracker) -> bool {
        match self.schema.validate_response(result) {
            Ok(()) => true,
            Err(violation) => {
                issues.add(Issue::DbMethodBadResponse {
                    method: self.method_id.clone(),
                    db_url: self.db_url.clone(),
                    response: result.clone(),
                    error: violation.to_string(),
                    recorded_at: now_micros(),
                });
                false
            }
        }
    }

    /// Validates `args`, runs the handler and checks its response.
    pub async fn invoke(
        &self,
        db: &Database,
        caller: Option<&str>,
        args: &Value,
        issues: &IssueTracker,
    ) -> Result<Value, DbError> {
        self.validate_call_args(args)?;
        let result = self
            .handler
            .call(MethodContext { db, caller }, args)
            .await?;
        let valid = self.validate_response(&result, issues);
        debug!(method = %self.method_id, db = %self.db_url, valid, "dbmethod handled");
        Ok(result)
    }
}

pub(crate) fn chron_key(created_at: u64, call_key: &str) -> String {
    format!("{created_at:020}:{call_key}")
}
