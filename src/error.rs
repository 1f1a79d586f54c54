use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Table,
    Entry,
    Blob,
    Schema,
    Method,
    Log,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Database => write!(f, "database"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::Entry => write!(f, "entry"),
            ResourceType::Blob => write!(f, "blob"),
            ResourceType::Schema => write!(f, "schema"),
            ResourceType::Method => write!(f, "method"),
            ResourceType::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Corruption,
    Unavailable,
    NotWritable,
    DatabaseNotFound,
    TableNotFound,
    EntryNotFound,
    BlobNotFound,
    SchemaNotFound,
    MethodNotFound,
    LogNotFound,
    Timeout,
    Handler,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Corruption => "corruption",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::NotWritable => "not_writable",
            ErrorCode::DatabaseNotFound => "database_not_found",
            ErrorCode::TableNotFound => "table_not_found",
            ErrorCode::EntryNotFound => "entry_not_found",
            ErrorCode::BlobNotFound => "blob_not_found",
            ErrorCode::SchemaNotFound => "schema_not_found",
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::LogNotFound => "log_not_found",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Handler => "handler",
        }
    }

    /// Error name surfaced to RPC clients alongside the numeric code.
    pub fn error_name(self) -> &'static str {
        match self {
            ErrorCode::Validation => "ValidationError",
            ErrorCode::DatabaseNotFound
            | ErrorCode::TableNotFound
            | ErrorCode::EntryNotFound
            | ErrorCode::BlobNotFound
            | ErrorCode::SchemaNotFound
            | ErrorCode::MethodNotFound
            | ErrorCode::LogNotFound => "NotFoundError",
            ErrorCode::Timeout => "TimeoutError",
            ErrorCode::NotWritable => "NotWritableError",
            _ => "Error",
        }
    }

    pub fn rpc_code(self) -> i64 {
        match self {
            ErrorCode::Validation => -32002,
            ErrorCode::DatabaseNotFound
            | ErrorCode::TableNotFound
            | ErrorCode::EntryNotFound
            | ErrorCode::BlobNotFound
            | ErrorCode::SchemaNotFound
            | ErrorCode::MethodNotFound
            | ErrorCode::LogNotFound => -32004,
            ErrorCode::Timeout => -32008,
            ErrorCode::NotWritable => -32003,
            _ => -32000,
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("corruption: {message}")]
    Corruption { message: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("database '{database}' is not writable")]
    NotWritable { database: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("timeout")]
    Timeout,
    #[error("handler error: {0}")]
    Handler(String),
}

impl DbError {
    pub fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        DbError::NotFound {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::Io(_) => ErrorCode::Io,
            DbError::Encode(_) => ErrorCode::Encode,
            DbError::Decode(_) => ErrorCode::Decode,
            DbError::Validation(_) => ErrorCode::Validation,
            DbError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            DbError::Corruption { .. } => ErrorCode::Corruption,
            DbError::Unavailable { .. } => ErrorCode::Unavailable,
            DbError::NotWritable { .. } => ErrorCode::NotWritable,
            DbError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Database => ErrorCode::DatabaseNotFound,
                ResourceType::Table => ErrorCode::TableNotFound,
                ResourceType::Entry => ErrorCode::EntryNotFound,
                ResourceType::Blob => ErrorCode::BlobNotFound,
                ResourceType::Schema => ErrorCode::SchemaNotFound,
                ResourceType::Method => ErrorCode::MethodNotFound,
                ResourceType::Log => ErrorCode::LogNotFound,
            },
            DbError::Timeout => ErrorCode::Timeout,
            DbError::Handler(_) => ErrorCode::Handler,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        DbError::Encode(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        DbError::Decode(value.to_string())
    }
}
