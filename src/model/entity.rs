// ABOUTME: Typed entity surface: properties, native values and assembled records
// ABOUTME: Entities declare a static property table and build themselves from a Record

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::NotifierError;

/// Native type a property expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    String,
    Chars,
    Bytes,
    Date,
    Time,
    DateTime,
    DateTimeLocal,
    DateTimeTz,
    Uuid,
}

/// A converted column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    String(String),
    Chars(Vec<char>),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeLocal(DateTime<Local>),
    DateTimeTz(DateTime<FixedOffset>),
    Uuid(Uuid),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::String(_) => ValueKind::String,
            Value::Chars(_) => ValueKind::Chars,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::DateTimeLocal(_) => ValueKind::DateTimeLocal,
            Value::DateTimeTz(_) => ValueKind::DateTimeTz,
            Value::Uuid(_) => ValueKind::Uuid,
        }
    }

    /// Render as JSON. Binary data becomes `{"_type": "blob", "data": "<base64>"}`
    /// so it stays distinguishable from text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::I16(i) => JsonValue::from(*i),
            Value::I32(i) => JsonValue::from(*i),
            Value::I64(i) => JsonValue::from(*i),
            Value::F32(f) => float_to_json(f64::from(*f)),
            Value::F64(f) => float_to_json(*f),
            // Decimals keep their exact digits as a string
            Value::Decimal(d) => JsonValue::String(d.to_string()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Chars(chars) => JsonValue::String(chars.iter().collect()),
            Value::Bytes(bytes) => {
                let encoded =
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
                serde_json::json!({
                    "_type": "blob",
                    "data": encoded
                })
            }
            Value::Date(d) => JsonValue::String(d.to_string()),
            Value::Time(t) => JsonValue::String(t.to_string()),
            Value::DateTime(dt) => JsonValue::String(dt.to_string()),
            Value::DateTimeLocal(dt) => JsonValue::String(dt.to_rfc3339()),
            Value::DateTimeTz(dt) => JsonValue::String(dt.to_rfc3339()),
            Value::Uuid(u) => JsonValue::String(u.to_string()),
        }
    }
}

fn float_to_json(f: f64) -> JsonValue {
    // JSON has no NaN or Infinity
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(f.to_string()))
}

/// One entry of an entity's static property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Identity properties must map to a column and follow the identity conversion policy
    pub identity: bool,
}

impl Property {
    pub const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            identity: false,
        }
    }

    pub const fn identity(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            identity: true,
        }
    }
}

/// A model that change events are delivered as.
///
/// ```
/// use change_notifier::model::{ChangeEntity, Property, Record, ValueKind};
///
/// struct Customer {
///     id: Option<i32>,
///     name: Option<String>,
/// }
///
/// impl ChangeEntity for Customer {
///     fn properties() -> &'static [Property] {
///         const PROPERTIES: &[Property] = &[
///             Property::identity("id", ValueKind::I32),
///             Property::new("name", ValueKind::String),
///         ];
///         PROPERTIES
///     }
///
///     fn from_record(record: &Record) -> anyhow::Result<Self> {
///         Ok(Customer {
///             id: record.get("id")?,
///             name: record.get("name")?,
///         })
///     }
/// }
/// ```
pub trait ChangeEntity: Sized + Send + 'static {
    fn properties() -> &'static [Property];

    fn from_record(record: &Record) -> anyhow::Result<Self>;
}

/// Extraction of a native type out of a `Value`.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! from_value {
    ($ty:ty, $($variant:ident => $convert:expr),+ $(,)?) => {
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    $(Value::$variant(v) => Some($convert(v)),)+
                    _ => None,
                }
            }
        }
    };
}

from_value!(bool, Bool => |v: &bool| *v);
from_value!(i16, I16 => |v: &i16| *v);
from_value!(i32, I32 => |v: &i32| *v, I16 => |v: &i16| i32::from(*v));
from_value!(i64, I64 => |v: &i64| *v, I32 => |v: &i32| i64::from(*v), I16 => |v: &i16| i64::from(*v));
from_value!(f32, F32 => |v: &f32| *v);
from_value!(f64, F64 => |v: &f64| *v, F32 => |v: &f32| f64::from(*v));
from_value!(Decimal, Decimal => |v: &Decimal| *v);
from_value!(String, String => |v: &String| v.clone(), Chars => |v: &Vec<char>| v.iter().collect());
from_value!(Vec<char>, Chars => |v: &Vec<char>| v.clone());
from_value!(Vec<u8>, Bytes => |v: &Vec<u8>| v.clone());
from_value!(NaiveDate, Date => |v: &NaiveDate| *v);
from_value!(NaiveTime, Time => |v: &NaiveTime| *v);
from_value!(NaiveDateTime, DateTime => |v: &NaiveDateTime| *v);
from_value!(DateTime<Local>, DateTimeLocal => |v: &DateTime<Local>| *v);
from_value!(DateTime<FixedOffset>, DateTimeTz => |v: &DateTime<FixedOffset>| *v);
from_value!(Uuid, Uuid => |v: &Uuid| *v);

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

/// Converted property values of one change, in binding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, Option<Value>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, property: impl Into<String>, value: Option<Value>) {
        let property = property.into();
        match self.values.iter_mut().find(|(name, _)| *name == property) {
            Some(slot) => slot.1 = value,
            None => self.values.push((property, value)),
        }
    }

    /// Raw value of a property; `None` when unmapped or null.
    pub fn value(&self, property: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == property)
            .and_then(|(_, value)| value.as_ref())
    }

    /// Typed value of a property. Unmapped and null properties read as `None`;
    /// a value of a different type is an error.
    pub fn get<T: FromValue>(&self, property: &str) -> Result<Option<T>, NotifierError> {
        match self.value(property) {
            None => Ok(None),
            Some(value) => T::from_value(value).map(Some).ok_or_else(|| {
                NotifierError::Mapping(format!(
                    "property '{}' holds a {:?} value, not {}",
                    property,
                    value.kind(),
                    std::any::type_name::<T>()
                ))
            }),
        }
    }

    /// Like `get`, but a missing value is an error.
    pub fn require<T: FromValue>(&self, property: &str) -> Result<T, NotifierError> {
        self.get(property)?
            .ok_or_else(|| NotifierError::Mapping(format!("property '{}' is null", property)))
    }

    pub fn contains(&self, property: &str) -> bool {
        self.values.iter().any(|(name, _)| name == property)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut json_obj = serde_json::Map::new();
        for (name, value) in &self.values {
            let json_value = value.as_ref().map(Value::to_json).unwrap_or(JsonValue::Null);
            json_obj.insert(name.clone(), json_value);
        }
        JsonValue::Object(json_obj)
    }
}
