//! Logical type model for stream schemas.
//!
//! A stream's declared schema arrives as a JSON-schema fragment. It is
//! converted once into a [`LogicalType`] tree, which drives both DDL (column
//! types) and the extraction/cast expressions emitted by the generator.
//! Types are immutable and compared structurally to detect schema drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Leaf types a column can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    String,
    Boolean,
    Integer,
    Number,
    Date,
    TimeWithTimezone,
    TimeWithoutTimezone,
    TimestampWithTimezone,
    TimestampWithoutTimezone,
    Unknown,
}

/// Logical type of a column or nested value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum LogicalType {
    Primitive(PrimitiveType),
    /// Ordered property list; order follows the declared schema.
    Struct(Vec<(String, LogicalType)>),
    Array(Box<LogicalType>),
    Union(Vec<LogicalType>),
}

impl LogicalType {
    pub fn string() -> Self {
        LogicalType::Primitive(PrimitiveType::String)
    }

    pub fn integer() -> Self {
        LogicalType::Primitive(PrimitiveType::Integer)
    }

    pub fn number() -> Self {
        LogicalType::Primitive(PrimitiveType::Number)
    }

    pub fn boolean() -> Self {
        LogicalType::Primitive(PrimitiveType::Boolean)
    }

    pub fn unknown() -> Self {
        LogicalType::Primitive(PrimitiveType::Unknown)
    }

    /// Convert a JSON-schema fragment into a logical type.
    ///
    /// Handles `type` (string or list), `format`, `airbyte_type` and `oneOf`.
    /// A nullable type such as `["null", "integer"]` collapses to its single
    /// non-null member; anything the schema does not describe becomes
    /// [`PrimitiveType::Unknown`].
    pub fn from_json_schema(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            return LogicalType::unknown();
        };

        if let Some(Value::Array(options)) = obj.get("oneOf") {
            let members: Vec<LogicalType> = options.iter().map(Self::from_json_schema).collect();
            return Self::union_of(members);
        }

        match obj.get("type") {
            Some(Value::String(ty)) => Self::from_type_name(ty, schema),
            Some(Value::Array(types)) => {
                let members: Vec<LogicalType> = types
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|t| *t != "null")
                    .map(|t| Self::from_type_name(t, schema))
                    .collect();
                Self::union_of(members)
            }
            _ if obj.contains_key("properties") => Self::from_type_name("object", schema),
            _ => LogicalType::unknown(),
        }
    }

    fn union_of(mut members: Vec<LogicalType>) -> Self {
        members.dedup();
        match members.len() {
            0 => LogicalType::unknown(),
            1 => members.remove(0),
            _ => LogicalType::Union(members),
        }
    }

    fn from_type_name(ty: &str, schema: &Value) -> Self {
        let format = schema.get("format").and_then(Value::as_str);
        let airbyte_type = schema.get("airbyte_type").and_then(Value::as_str);

        match ty {
            "string" => match (format, airbyte_type) {
                (Some("date"), _) => LogicalType::Primitive(PrimitiveType::Date),
                (Some("date-time"), Some("timestamp_without_timezone")) => {
                    LogicalType::Primitive(PrimitiveType::TimestampWithoutTimezone)
                }
                (Some("date-time"), _) => {
                    LogicalType::Primitive(PrimitiveType::TimestampWithTimezone)
                }
                (Some("time"), Some("time_without_timezone")) => {
                    LogicalType::Primitive(PrimitiveType::TimeWithoutTimezone)
                }
                (Some("time"), _) => LogicalType::Primitive(PrimitiveType::TimeWithTimezone),
                _ => LogicalType::string(),
            },
            "integer" => LogicalType::integer(),
            "number" if airbyte_type == Some("integer") => LogicalType::integer(),
            "number" => LogicalType::number(),
            "boolean" => LogicalType::boolean(),
            "array" => {
                let items = schema
                    .get("items")
                    .map(Self::from_json_schema)
                    .unwrap_or_else(LogicalType::unknown);
                LogicalType::Array(Box::new(items))
            }
            "object" => {
                let properties = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, sub)| (name.clone(), Self::from_json_schema(sub)))
                            .collect()
                    })
                    .unwrap_or_default();
                LogicalType::Struct(properties)
            }
            _ => LogicalType::unknown(),
        }
    }

    /// The single type a column of this logical type is materialized as.
    ///
    /// Unions pick their widest member: struct, then array, then string,
    /// number, integer, boolean and finally the temporal types.
    pub fn choose_type(&self) -> &LogicalType {
        match self {
            LogicalType::Union(members) => members
                .iter()
                .map(|m| m.choose_type())
                .max_by_key(|m| m.widening_rank())
                .unwrap_or(self),
            other => other,
        }
    }

    fn widening_rank(&self) -> u8 {
        match self {
            LogicalType::Struct(_) => 12,
            LogicalType::Array(_) => 11,
            LogicalType::Union(_) => 10,
            LogicalType::Primitive(p) => match p {
                PrimitiveType::Unknown => 10,
                PrimitiveType::String => 9,
                PrimitiveType::Number => 8,
                PrimitiveType::Integer => 7,
                PrimitiveType::Boolean => 6,
                PrimitiveType::TimestampWithTimezone => 5,
                PrimitiveType::TimestampWithoutTimezone => 4,
                PrimitiveType::TimeWithTimezone => 3,
                PrimitiveType::TimeWithoutTimezone => 2,
                PrimitiveType::Date => 1,
            },
        }
    }

    /// True when the materialized column holds semi-structured JSON.
    pub fn is_semi_structured(&self) -> bool {
        matches!(
            self.choose_type(),
            LogicalType::Struct(_)
                | LogicalType::Array(_)
                | LogicalType::Union(_)
                | LogicalType::Primitive(PrimitiveType::Unknown)
        )
    }
}
