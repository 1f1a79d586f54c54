//! Table and method schemas.
//!
//! Validation is a capability behind [`Validator`]; [`RecordSchema`] is the
//! built-in field checker and closures work for anything more specialised.

use crate::error::{DbError, ResourceType};
use crate::lib_helpers::now_micros;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const INDEX_STATE_SCHEMA: &str = "tabledb.system/index-state";
pub const DBMETHOD_CALL_SCHEMA: &str = "tabledb.system/dbmethod-call";
pub const DBMETHOD_RESULT_SCHEMA: &str = "tabledb.system/dbmethod-result";
pub const DBMETHOD_RESULT_CHRON_IDX_SCHEMA: &str = "tabledb.system/dbmethod-result-chron-idx";
pub const BLOB_POINTER_SCHEMA: &str = "tabledb.system/blob-pointer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer to the offending value; empty for the root.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} {}", self.path, self.message)
        }
    }
}

pub trait Validator: Send + Sync {
    /// Returns the first violation found.
    fn validate(&self, value: &Value) -> Result<(), SchemaViolation>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<(), SchemaViolation> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String {
        min_len: Option<usize>,
        max_len: Option<usize>,
    },
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn string() -> Self {
        FieldType::String {
            min_len: None,
            max_len: None,
        }
    }

    pub fn string_len(min_len: usize, max_len: usize) -> Self {
        FieldType::String {
            min_len: Some(min_len),
            max_len: Some(max_len),
        }
    }

    fn check(&self, path: &str, value: &Value) -> Result<(), SchemaViolation> {
        let ok = match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String { min_len, max_len }, Value::String(s)) => {
                let len = s.chars().count();
                if let Some(min) = min_len
                    && len < *min
                {
                    return Err(SchemaViolation::new(
                        path,
                        format!("must NOT have fewer than {min} characters"),
                    ));
                }
                if let Some(max) = max_len
                    && len > *max
                {
                    return Err(SchemaViolation::new(
                        path,
                        format!("must NOT have more than {max} characters"),
                    ));
                }
                true
            }
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(SchemaViolation::new(path, format!("must be {}", self.name())))
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String { .. } => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
}

/// Checks that a value is an object with the declared fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
    closed: bool,
}

impl RecordSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: false,
        });
        self
    }

    /// Rejects properties that are not declared.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }
}

impl Validator for RecordSchema {
    fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        let Value::Object(map) = value else {
            return Err(SchemaViolation::new("", "must be object"));
        };
        for field in &self.fields {
            let path = format!("/{}", field.name);
            match map.get(&field.name) {
                Some(v) => field.ty.check(&path, v)?,
                None if field.required => {
                    return Err(SchemaViolation::new(
                        "",
                        format!("must have required property '{}'", field.name),
                    ));
                }
                None => {}
            }
        }
        if self.closed
            && let Some(extra) = map
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
        {
            return Err(SchemaViolation::new(
                format!("/{extra}"),
                "must NOT have additional properties",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// String or integer found at this JSON pointer.
    Field(String),
    /// Monotonic hex timestamp.
    Auto,
}

pub struct TableSchema {
    pub id: String,
    validator: Arc<dyn Validator>,
    key: KeyStrategy,
    last_auto_key: AtomicU64,
}

impl TableSchema {
    pub fn new(id: impl Into<String>, validator: impl Validator + 'static, key: KeyStrategy) -> Self {
        Self {
            id: id.into(),
            validator: Arc::new(validator),
            key,
            last_auto_key: AtomicU64::new(0),
        }
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    pub fn validate(&self, value: &Value) -> bool {
        self.validator.validate(value).is_ok()
    }

    pub fn assert_valid(&self, value: &Value) -> Result<(), DbError> {
        self.validator
            .validate(value)
            .map_err(|v| DbError::Validation(format!("{}: {v}", self.id)))
    }

    pub fn generate_key(&self, value: &Value) -> Result<String, DbError> {
        match &self.key {
            KeyStrategy::Field(pointer) => match value.pointer(pointer) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(DbError::Validation(format!(
                    "{}: cannot generate key, {pointer} is missing",
                    self.id
                ))),
            },
            KeyStrategy::Auto => {
                let now = now_micros();
                let prev = self
                    .last_auto_key
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                        Some(now.max(last + 1))
                    })
                    .unwrap_or(now);
                Ok(format!("{:016x}", now.max(prev + 1)))
            }
        }
    }

    /// Namespace path `domain/name` split into its two sub-collection names.
    pub fn namespace(&self) -> Result<(&str, &str), DbError> {
        self.id
            .split_once('/')
            .filter(|(domain, name)| !domain.is_empty() && !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| {
                DbError::Validation(format!("schema id '{}' is not of the form domain/name", self.id))
            })
    }
}

impl fmt::Debug for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSchema")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub struct MethodSchema {
    pub id: String,
    params: Option<Arc<dyn Validator>>,
    response: Option<Arc<dyn Validator>>,
}

impl MethodSchema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: None,
            response: None,
        }
    }

    pub fn with_params(mut self, validator: impl Validator + 'static) -> Self {
        self.params = Some(Arc::new(validator));
        self
    }

    pub fn with_response(mut self, validator: impl Validator + 'static) -> Self {
        self.response = Some(Arc::new(validator));
        self
    }

    pub fn validate_params(&self, args: &Value) -> Result<(), SchemaViolation> {
        match &self.params {
            Some(v) => v.validate(args),
            None => Ok(()),
        }
    }

    pub fn validate_response(&self, result: &Value) -> Result<(), SchemaViolation> {
        match &self.response {
            Some(v) => v.validate(result),
            None => Ok(()),
        }
    }
}

/// Schema id to capability lookup, resolved once per id.
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
    methods: RwLock<HashMap<String, Arc<MethodSchema>>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// A registry holding the reserved system schemas.
    pub fn new() -> Self {
        let registry = Self {
            tables: RwLock::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
        };
        for schema in system_schemas() {
            registry.register_table(schema);
        }
        registry
    }

    pub fn register_table(&self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        self.tables
            .write()
            .insert(schema.id.clone(), Arc::clone(&schema));
        schema
    }

    pub fn register_method(&self, schema: MethodSchema) -> Arc<MethodSchema> {
        let schema = Arc::new(schema);
        self.methods
            .write()
            .insert(schema.id.clone(), Arc::clone(&schema));
        schema
    }

    pub fn table(&self, id: &str) -> Result<Arc<TableSchema>, DbError> {
        self.tables
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::not_found(ResourceType::Schema, id))
    }

    pub fn has_table(&self, id: &str) -> bool {
        self.tables.read().contains_key(id)
    }

    pub fn method(&self, id: &str) -> Result<Arc<MethodSchema>, DbError> {
        self.methods
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::not_found(ResourceType::Schema, id))
    }
}

fn system_schemas() -> Vec<TableSchema> {
    vec![
        TableSchema::new(
            INDEX_STATE_SCHEMA,
            RecordSchema::new()
                .required("schemaId", FieldType::string_len(1, 256))
                .required("subject", FieldType::Object)
                .required("updatedAt", FieldType::Integer),
            KeyStrategy::Auto,
        ),
        TableSchema::new(
            DBMETHOD_CALL_SCHEMA,
            RecordSchema::new()
                .required("method", FieldType::string_len(1, 256))
                .required("args", FieldType::Any)
                .optional("caller", FieldType::string())
                .required("createdAt", FieldType::Integer),
            KeyStrategy::Auto,
        ),
        TableSchema::new(
            DBMETHOD_RESULT_SCHEMA,
            RecordSchema::new()
                .required("callKey", FieldType::string_len(1, 64))
                .required("callUrl", FieldType::string())
                .required("method", FieldType::string())
                .required("code", FieldType::string())
                .optional("details", FieldType::Any)
                .required("createdAt", FieldType::Integer),
            KeyStrategy::Field("/callKey".into()),
        ),
        TableSchema::new(
            DBMETHOD_RESULT_CHRON_IDX_SCHEMA,
            RecordSchema::new()
                .required("chronKey", FieldType::string())
                .required("resultUrl", FieldType::string()),
            KeyStrategy::Field("/chronKey".into()),
        ),
    ]
}

/// Pointer records live in the `_blobs` sub-collection rather than under a
/// `domain/name` namespace, so this schema is kept out of the registry.
pub(crate) fn blob_pointer_schema() -> TableSchema {
    TableSchema::new(
        BLOB_POINTER_SCHEMA,
        RecordSchema::new()
            .required("start", FieldType::Integer)
            .required("end", FieldType::Integer)
            .optional("mimeType", FieldType::string()),
        KeyStrategy::Auto,
    )
}
