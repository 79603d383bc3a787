// ABOUTME: Declared-type tables and temporal formats per backing store
// ABOUTME: Maps a column's declared type name onto a canonical ColumnType

use std::fmt;

/// Canonical column type every declared type name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Real,
    Double,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    /// Timestamp rendered in the session's local zone, no offset on the wire
    TimestampLocalTz,
    /// Timestamp followed by a separately encoded zone offset
    TimestampTz,
    Uuid,
}

impl ColumnType {
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ColumnType::Date
                | ColumnType::Timestamp
                | ColumnType::TimestampLocalTz
                | ColumnType::TimestampTz
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A pair of formats for one temporal family.
///
/// `source` is the backing store's own format string, used when the trigger
/// renders a value into a payload. `target` is the chrono format used to parse it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalFormat {
    pub source: &'static str,
    pub target: &'static str,
    /// Store format of the offset suffix, for zone-carrying timestamps
    pub offset_source: Option<&'static str>,
}

const DATE_TARGET: &str = "%Y-%m-%d";
const TIMESTAMP_TARGET: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIME_TARGET: &str = "%H:%M:%S%.f";

/// Separator between the timestamp body and its offset suffix on the wire.
pub const OFFSET_SEPARATOR: char = ' ';

/// A backing store's type marshal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub name: &'static str,
    types: &'static [(&'static str, ColumnType)],
    pub date: TemporalFormat,
    pub timestamp: TemporalFormat,
    pub timestamp_local: TemporalFormat,
    pub timestamp_tz: TemporalFormat,
}

impl Dialect {
    pub const POSTGRES: Dialect = Dialect {
        name: "postgres",
        types: &[
            ("boolean", ColumnType::Boolean),
            ("bool", ColumnType::Boolean),
            ("smallint", ColumnType::SmallInt),
            ("int2", ColumnType::SmallInt),
            ("integer", ColumnType::Integer),
            ("int", ColumnType::Integer),
            ("int4", ColumnType::Integer),
            ("serial", ColumnType::Integer),
            ("bigint", ColumnType::BigInt),
            ("int8", ColumnType::BigInt),
            ("bigserial", ColumnType::BigInt),
            ("numeric", ColumnType::Decimal),
            ("decimal", ColumnType::Decimal),
            ("money", ColumnType::Decimal),
            ("real", ColumnType::Real),
            ("float4", ColumnType::Real),
            ("double precision", ColumnType::Double),
            ("float8", ColumnType::Double),
            ("text", ColumnType::Text),
            ("character varying", ColumnType::Text),
            ("varchar", ColumnType::Text),
            ("character", ColumnType::Text),
            ("char", ColumnType::Text),
            ("bpchar", ColumnType::Text),
            ("name", ColumnType::Text),
            ("citext", ColumnType::Text),
            ("json", ColumnType::Text),
            ("jsonb", ColumnType::Text),
            ("xml", ColumnType::Text),
            ("bytea", ColumnType::Binary),
            ("date", ColumnType::Date),
            ("time", ColumnType::Time),
            ("time without time zone", ColumnType::Time),
            ("timestamp", ColumnType::Timestamp),
            ("timestamp without time zone", ColumnType::Timestamp),
            ("timestamptz", ColumnType::TimestampTz),
            ("timestamp with time zone", ColumnType::TimestampTz),
            ("uuid", ColumnType::Uuid),
        ],
        date: TemporalFormat {
            source: "YYYY-MM-DD",
            target: DATE_TARGET,
            offset_source: None,
        },
        timestamp: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.US",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_local: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.US",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_tz: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.US",
            target: TIMESTAMP_TARGET,
            offset_source: Some("OF"),
        },
    };

    pub const SQL_SERVER: Dialect = Dialect {
        name: "sqlserver",
        types: &[
            ("bit", ColumnType::Boolean),
            ("tinyint", ColumnType::SmallInt),
            ("smallint", ColumnType::SmallInt),
            ("int", ColumnType::Integer),
            ("bigint", ColumnType::BigInt),
            ("decimal", ColumnType::Decimal),
            ("numeric", ColumnType::Decimal),
            ("money", ColumnType::Decimal),
            ("smallmoney", ColumnType::Decimal),
            ("real", ColumnType::Real),
            ("float", ColumnType::Double),
            ("char", ColumnType::Text),
            ("varchar", ColumnType::Text),
            ("nchar", ColumnType::Text),
            ("nvarchar", ColumnType::Text),
            ("text", ColumnType::Text),
            ("ntext", ColumnType::Text),
            ("xml", ColumnType::Text),
            ("binary", ColumnType::Binary),
            ("varbinary", ColumnType::Binary),
            ("image", ColumnType::Binary),
            ("timestamp", ColumnType::Binary),
            ("rowversion", ColumnType::Binary),
            ("date", ColumnType::Date),
            ("time", ColumnType::Time),
            ("datetime", ColumnType::Timestamp),
            ("datetime2", ColumnType::Timestamp),
            ("smalldatetime", ColumnType::Timestamp),
            ("datetimeoffset", ColumnType::TimestampTz),
            ("uniqueidentifier", ColumnType::Uuid),
        ],
        date: TemporalFormat {
            source: "yyyy-MM-dd",
            target: DATE_TARGET,
            offset_source: None,
        },
        timestamp: TemporalFormat {
            source: "yyyy-MM-dd HH:mm:ss.fffffff",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_local: TemporalFormat {
            source: "yyyy-MM-dd HH:mm:ss.fffffff",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_tz: TemporalFormat {
            source: "yyyy-MM-dd HH:mm:ss.fffffff",
            target: TIMESTAMP_TARGET,
            offset_source: Some("zzz"),
        },
    };

    pub const ORACLE: Dialect = Dialect {
        name: "oracle",
        types: &[
            ("number", ColumnType::Decimal),
            ("float", ColumnType::Double),
            ("binary_float", ColumnType::Real),
            ("binary_double", ColumnType::Double),
            ("char", ColumnType::Text),
            ("nchar", ColumnType::Text),
            ("varchar2", ColumnType::Text),
            ("nvarchar2", ColumnType::Text),
            ("clob", ColumnType::Text),
            ("nclob", ColumnType::Text),
            ("raw", ColumnType::Binary),
            ("blob", ColumnType::Binary),
            ("date", ColumnType::Date),
            ("timestamp", ColumnType::Timestamp),
            ("timestamp with local time zone", ColumnType::TimestampLocalTz),
            ("timestamp with time zone", ColumnType::TimestampTz),
        ],
        date: TemporalFormat {
            source: "YYYY-MM-DD",
            target: DATE_TARGET,
            offset_source: None,
        },
        timestamp: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.FF6",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_local: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.FF6",
            target: TIMESTAMP_TARGET,
            offset_source: None,
        },
        timestamp_tz: TemporalFormat {
            source: "YYYY-MM-DD HH24:MI:SS.FF6",
            target: TIMESTAMP_TARGET,
            offset_source: Some("TZH:TZM"),
        },
    };

    /// Resolve a declared type name, ignoring case, length/precision
    /// suffixes and repeated whitespace.
    pub fn column_type(&self, declared: &str) -> Option<ColumnType> {
        let normalized = normalize_type_name(declared);
        self.types
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, column_type)| *column_type)
    }

    pub fn supports(&self, declared: &str) -> bool {
        self.column_type(declared).is_some()
    }

    /// Formats used for a temporal column type; `None` for non-temporal types.
    pub fn temporal_format(&self, column_type: ColumnType) -> Option<&TemporalFormat> {
        match column_type {
            ColumnType::Date => Some(&self.date),
            ColumnType::Timestamp => Some(&self.timestamp),
            ColumnType::TimestampLocalTz => Some(&self.timestamp_local),
            ColumnType::TimestampTz => Some(&self.timestamp_tz),
            _ => None,
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::POSTGRES
    }
}

/// Chrono format for a time-of-day payload.
pub(crate) fn time_target() -> &'static str {
    TIME_TARGET
}

fn normalize_type_name(declared: &str) -> String {
    let mut stripped = String::with_capacity(declared.len());
    let mut depth = 0usize;
    for c in declared.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c.to_ascii_lowercase()),
            _ => {}
        }
    }
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
