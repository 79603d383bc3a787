// ABOUTME: Type Marshaler: raw column payloads into native property values
// ABOUTME: Text decoding, culture-aware numbers and dialect-driven temporal parsing

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Culture, TextEncoding};
use crate::model::{Value, ValueKind};

use super::dialect::{time_target, ColumnType, Dialect, OFFSET_SEPARATOR};

/// Why a single payload could not be converted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("unsupported column type '{0}'")]
    UnsupportedColumnType(String),

    #[error("'{value}' is not a valid {target:?} value")]
    Indeterminate { value: String, target: ValueKind },

    #[error("payload is not valid {encoding:?}: {reason}")]
    Encoding {
        encoding: TextEncoding,
        reason: String,
    },

    #[error("cannot parse '{value}' as {target:?}: {reason}")]
    Parse {
        value: String,
        target: ValueKind,
        reason: String,
    },

    #[error("a {column_type} column cannot be read as {target:?}")]
    Incompatible {
        column_type: ColumnType,
        target: ValueKind,
    },
}

/// Decode a text payload in the store's encoding.
pub fn decode_text(bytes: &[u8], encoding: TextEncoding) -> Result<String, ConversionError> {
    let encoding_error = |reason: String| ConversionError::Encoding { encoding, reason };
    match encoding {
        TextEncoding::Utf8 => {
            String::from_utf8(bytes.to_vec()).map_err(|err| encoding_error(err.to_string()))
        }
        TextEncoding::Utf16Le => {
            if bytes.len() % 2 != 0 {
                return Err(encoding_error(format!("odd byte length {}", bytes.len())));
            }
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
            char::decode_utf16(units)
                .collect::<Result<String, _>>()
                .map_err(|err| encoding_error(err.to_string()))
        }
        TextEncoding::Latin1 => Ok(bytes.iter().map(|b| char::from(*b)).collect()),
    }
}

/// Encode text in the store's encoding.
pub fn encode_text(text: &str, encoding: TextEncoding) -> Result<Vec<u8>, ConversionError> {
    match encoding {
        TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        TextEncoding::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        TextEncoding::Latin1 => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| ConversionError::Encoding {
                    encoding,
                    reason: format!("'{}' is outside Latin-1", c),
                })
            })
            .collect(),
    }
}

/// Converts payloads of one table, using its dialect, encoding and culture.
#[derive(Debug, Clone)]
pub struct Marshaler {
    dialect: Dialect,
    encoding: TextEncoding,
    culture: Culture,
}

impl Marshaler {
    pub fn new(dialect: Dialect, encoding: TextEncoding, culture: Culture) -> Self {
        Self {
            dialect,
            encoding,
            culture,
        }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Convert a payload of a column with the given declared type.
    ///
    /// ```
    /// use change_notifier::config::{Culture, TextEncoding};
    /// use change_notifier::marshal::{Dialect, Marshaler};
    /// use change_notifier::model::{Value, ValueKind};
    ///
    /// let marshaler = Marshaler::new(Dialect::POSTGRES, TextEncoding::Utf8, Culture::invariant());
    /// let value = marshaler.convert(Some(b"42"), "integer", ValueKind::I32).unwrap();
    /// assert_eq!(value, Some(Value::I32(42)));
    /// assert_eq!(marshaler.convert(Some(b""), "integer", ValueKind::I32).unwrap(), None);
    /// ```
    pub fn convert(
        &self,
        raw: Option<&[u8]>,
        declared: &str,
        target: ValueKind,
    ) -> Result<Option<Value>, ConversionError> {
        let column_type = self
            .dialect
            .column_type(declared)
            .ok_or_else(|| ConversionError::UnsupportedColumnType(declared.to_string()))?;
        self.convert_column(raw, column_type, target)
    }

    /// Convert a payload of an already resolved column type.
    pub fn convert_column(
        &self,
        raw: Option<&[u8]>,
        column_type: ColumnType,
        target: ValueKind,
    ) -> Result<Option<Value>, ConversionError> {
        let raw = match raw {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok(None),
        };

        if target == ValueKind::Bytes {
            return Ok(Some(Value::Bytes(raw.to_vec())));
        }
        if column_type == ColumnType::Binary {
            return Err(ConversionError::Incompatible {
                column_type,
                target,
            });
        }

        let text = decode_text(raw, self.encoding)?;
        let value = match target {
            ValueKind::Bool => Value::Bool(parse_bool(&text)?),
            ValueKind::Chars => Value::Chars(text.chars().collect()),
            ValueKind::String => Value::String(text),
            ValueKind::I16 => Value::I16(self.parse_number(&text, target)?),
            ValueKind::I32 => Value::I32(self.parse_number(&text, target)?),
            ValueKind::I64 => Value::I64(self.parse_number(&text, target)?),
            ValueKind::F32 => Value::F32(self.parse_number(&text, target)?),
            ValueKind::F64 => Value::F64(self.parse_number(&text, target)?),
            ValueKind::Decimal => Value::Decimal(self.parse_decimal(&text)?),
            ValueKind::Uuid => Value::Uuid(
                Uuid::parse_str(text.trim()).map_err(|err| parse_error(&text, target, err))?,
            ),
            ValueKind::Time => {
                if column_type != ColumnType::Time {
                    return Err(ConversionError::Incompatible {
                        column_type,
                        target,
                    });
                }
                Value::Time(
                    NaiveTime::parse_from_str(text.trim(), time_target())
                        .map_err(|err| parse_error(&text, target, err))?,
                )
            }
            ValueKind::Date
            | ValueKind::DateTime
            | ValueKind::DateTimeLocal
            | ValueKind::DateTimeTz => self.parse_temporal(&text, column_type, target)?,
            ValueKind::Bytes => Value::Bytes(raw.to_vec()),
        };
        Ok(Some(value))
    }

    /// Render a value the way the store's trigger would put it on the wire.
    pub fn encode(&self, value: &Value, column_type: ColumnType) -> Result<Vec<u8>, ConversionError> {
        let text = match value {
            Value::Bytes(bytes) => return Ok(bytes.clone()),
            Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            Value::I16(i) => i.to_string(),
            Value::I32(i) => i.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F32(f) => self.culture.localize_number(&f.to_string()),
            Value::F64(f) => self.culture.localize_number(&f.to_string()),
            Value::Decimal(d) => self.culture.localize_number(&d.to_string()),
            Value::String(s) => s.clone(),
            Value::Chars(chars) => chars.iter().collect(),
            Value::Uuid(u) => u.to_string(),
            Value::Time(t) => t.format(time_target()).to_string(),
            Value::Date(d) => d.format(self.target_format(column_type, ColumnType::Date)).to_string(),
            Value::DateTime(dt) => dt
                .format(self.target_format(column_type, ColumnType::Timestamp))
                .to_string(),
            Value::DateTimeLocal(dt) => dt
                .naive_local()
                .format(self.target_format(column_type, ColumnType::TimestampLocalTz))
                .to_string(),
            Value::DateTimeTz(dt) => format!(
                "{}{}{}",
                dt.naive_local()
                    .format(self.target_format(column_type, ColumnType::TimestampTz)),
                OFFSET_SEPARATOR,
                dt.offset()
            ),
        };
        encode_text(&text, self.encoding)
    }

    fn target_format(&self, column_type: ColumnType, fallback: ColumnType) -> &'static str {
        self.dialect
            .temporal_format(column_type)
            .or_else(|| self.dialect.temporal_format(fallback))
            .map(|format| format.target)
            .unwrap_or("%Y-%m-%d %H:%M:%S%.f")
    }

    fn parse_number<T>(&self, text: &str, target: ValueKind) -> Result<T, ConversionError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let normalized = self.culture.normalize_number(text.trim());
        normalized
            .parse::<T>()
            .map_err(|err| parse_error(text, target, err))
    }

    fn parse_decimal(&self, text: &str) -> Result<Decimal, ConversionError> {
        let normalized = self.culture.normalize_number(text.trim());
        Decimal::from_str(&normalized)
            .or_else(|_| Decimal::from_scientific(&normalized))
            .map_err(|err| parse_error(text, ValueKind::Decimal, err))
    }

    /// Temporal payloads are parsed by the format of the declared column type.
    fn parse_temporal(
        &self,
        text: &str,
        column_type: ColumnType,
        target: ValueKind,
    ) -> Result<Value, ConversionError> {
        let incompatible = || ConversionError::Incompatible {
            column_type,
            target,
        };
        let format = self.dialect.temporal_format(column_type).ok_or_else(incompatible)?;
        let trimmed = text.trim();

        match (column_type, target) {
            (ColumnType::Date, ValueKind::Date) => NaiveDate::parse_from_str(trimmed, format.target)
                .map(Value::Date)
                .map_err(|err| parse_error(text, target, err)),
            (ColumnType::Date, ValueKind::DateTime) => {
                NaiveDate::parse_from_str(trimmed, format.target)
                    .map(|date| Value::DateTime(date.and_time(NaiveTime::MIN)))
                    .map_err(|err| parse_error(text, target, err))
            }
            (ColumnType::Timestamp | ColumnType::TimestampLocalTz, ValueKind::DateTime) => {
                NaiveDateTime::parse_from_str(trimmed, format.target)
                    .map(Value::DateTime)
                    .map_err(|err| parse_error(text, target, err))
            }
            (ColumnType::Timestamp | ColumnType::TimestampLocalTz, ValueKind::DateTimeLocal) => {
                let naive = NaiveDateTime::parse_from_str(trimmed, format.target)
                    .map_err(|err| parse_error(text, target, err))?;
                Local
                    .from_local_datetime(&naive)
                    .earliest()
                    .map(Value::DateTimeLocal)
                    .ok_or_else(|| ConversionError::Parse {
                        value: text.to_string(),
                        target,
                        reason: "local time does not exist".to_string(),
                    })
            }
            (ColumnType::TimestampTz, ValueKind::DateTimeTz | ValueKind::DateTimeLocal) => {
                let parsed = parse_zoned(trimmed, format.target)
                    .map_err(|reason| ConversionError::Parse {
                        value: text.to_string(),
                        target,
                        reason,
                    })?;
                Ok(match target {
                    ValueKind::DateTimeLocal => Value::DateTimeLocal(parsed.with_timezone(&Local)),
                    _ => Value::DateTimeTz(parsed),
                })
            }
            (ColumnType::TimestampTz, ValueKind::DateTime) => parse_zoned(trimmed, format.target)
                .map(|parsed| Value::DateTime(parsed.naive_utc()))
                .map_err(|reason| ConversionError::Parse {
                    value: text.to_string(),
                    target,
                    reason,
                }),
            _ => Err(incompatible()),
        }
    }
}

fn parse_error(value: &str, target: ValueKind, err: impl std::fmt::Display) -> ConversionError {
    ConversionError::Parse {
        value: value.to_string(),
        target,
        reason: err.to_string(),
    }
}

/// Booleans travel as `0`/`1`; anything else is indeterminate.
fn parse_bool(text: &str) -> Result<bool, ConversionError> {
    match text.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ConversionError::Indeterminate {
            value: other.to_string(),
            target: ValueKind::Bool,
        }),
    }
}

/// `<timestamp><separator><offset>`, the offset encoded on its own.
fn parse_zoned(text: &str, body_format: &str) -> Result<DateTime<FixedOffset>, String> {
    let (body, offset) = text
        .rsplit_once(OFFSET_SEPARATOR)
        .ok_or_else(|| "missing zone offset".to_string())?;
    let naive = NaiveDateTime::parse_from_str(body.trim(), body_format).map_err(|e| e.to_string())?;
    let offset = parse_offset(offset)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| "ambiguous timestamp".to_string())
}

/// Accepts `Z`, `+HH`, `+HHMM` and `+HH:MM`.
fn parse_offset(text: &str) -> Result<FixedOffset, String> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }
    let (sign, digits) = if let Some(rest) = text.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = text.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(format!("invalid offset '{}'", text));
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid offset '{}'", text));
    }
    let (hours, minutes) = match digits.len() {
        2 => (&digits[..2], "0"),
        4 => (&digits[..2], &digits[2..]),
        _ => return Err(format!("invalid offset '{}'", text)),
    };
    let hours: i32 = hours.parse().map_err(|_| format!("invalid offset '{}'", text))?;
    let minutes: i32 = minutes.parse().map_err(|_| format!("invalid offset '{}'", text))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset '{}' out of range", text))
}
