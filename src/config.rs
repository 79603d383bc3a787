// ABOUTME: Configuration surface for a change notifier
// ABOUTME: Loads from TOML, supplies defaults and validates before start

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::protocol::ChangeKind;

/// Text encoding used by the backing store for message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
}

/// Number formatting rules applied when parsing numeric payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Culture {
    pub decimal_separator: char,
    pub group_separator: Option<char>,
}

impl Default for Culture {
    fn default() -> Self {
        Self::invariant()
    }
}

impl Culture {
    /// `1234.5`: dot decimals, no grouping.
    pub fn invariant() -> Self {
        Self {
            decimal_separator: '.',
            group_separator: None,
        }
    }

    /// Rewrite a culture-formatted number into invariant form.
    pub fn normalize_number<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.decimal_separator == '.' && self.group_separator.is_none() {
            return Cow::Borrowed(text);
        }
        let normalized = text
            .chars()
            .filter(|c| Some(*c) != self.group_separator)
            .map(|c| if c == self.decimal_separator { '.' } else { c })
            .collect();
        Cow::Owned(normalized)
    }

    /// Render an invariant number in this culture.
    pub fn localize_number(&self, text: &str) -> String {
        if self.decimal_separator == '.' {
            return text.to_string();
        }
        text.replace('.', &self.decimal_separator.to_string())
    }
}

/// What happens when an identity property's payload cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityConversionPolicy {
    /// Drop the whole record and report the fault.
    #[default]
    Abort,
    /// Leave the identity property null and dispatch the record anyway.
    NullFill,
}

/// Bounded reconnect applied to transient transport faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect attempts before the fault becomes terminal
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry
    pub initial_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Timeouts handed to `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Upper bound of one blocking receive
    pub timeout: Duration,
    /// Maximum time without any received notification before the feed is declared dead
    pub watchdog_timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self::from_secs(120, 180)
    }
}

impl StartOptions {
    pub fn from_secs(timeout_secs: u64, watchdog_timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            watchdog_timeout: Duration::from_secs(watchdog_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("receive timeout must be greater than zero");
        }
        if self.watchdog_timeout.is_zero() {
            bail!("watchdog timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Everything a notifier needs besides the backend and the model.
///
/// ```
/// # use change_notifier::config::NotifierConfig;
/// let config = NotifierConfig::from_toml_str(r#"
///     schema = "sales"
///     table = "orders"
///     timeout_secs = 30
///
///     [mappings]
///     customer_name = "Customer Name"
/// "#).unwrap();
/// assert_eq!(config.qualified_table(), "sales.orders");
/// assert_eq!(config.watchdog_timeout_secs, 180);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub schema: String,
    pub table: String,
    pub timeout_secs: u64,
    pub watchdog_timeout_secs: u64,
    pub encoding: TextEncoding,
    pub culture: Culture,
    /// Explicit property -> column overrides
    pub mappings: BTreeMap<String, String>,
    /// Already-compiled backing-store filter clause
    pub filter: Option<String>,
    /// Change kinds the trigger should report
    pub listen_on: Vec<ChangeKind>,
    /// Only report updates touching these columns (empty = any column)
    pub update_of: Vec<String>,
    pub identity_conversion: IdentityConversionPolicy,
    pub reconnect: ReconnectPolicy,
    /// Ask the transport for heartbeat cycles while the table is quiet
    pub heartbeat: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: String::new(),
            timeout_secs: 120,
            watchdog_timeout_secs: 180,
            encoding: TextEncoding::default(),
            culture: Culture::default(),
            mappings: BTreeMap::new(),
            filter: None,
            listen_on: vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete],
            update_of: Vec::new(),
            identity_conversion: IdentityConversionPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: true,
        }
    }
}

impl NotifierConfig {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: NotifierConfig =
            toml::from_str(contents).context("Failed to parse notifier config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read notifier config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid notifier config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            bail!("table name cannot be empty");
        }
        if self.schema.trim().is_empty() {
            bail!("schema name cannot be empty");
        }
        self.start_options().validate()?;
        if self.listen_on.iter().all(|kind| kind.is_heartbeat()) {
            bail!("listen_on must name at least one of Insert, Update or Delete");
        }
        if !self.update_of.is_empty() && !self.listen_on.contains(&ChangeKind::Update) {
            bail!("update_of requires Update in listen_on");
        }
        if self.culture.group_separator == Some(self.culture.decimal_separator) {
            bail!("decimal and group separators must differ");
        }
        Ok(())
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions::from_secs(self.timeout_secs, self.watchdog_timeout_secs)
    }

    /// `schema.table`, used in logs and fault messages.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = NotifierConfig::new("public", "customers");
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(config.watchdog_timeout_secs, 180);
        assert_eq!(config.encoding, TextEncoding::Utf8);
        assert_eq!(config.identity_conversion, IdentityConversionPolicy::Abort);
        assert!(config.heartbeat);
        assert_eq!(config.listen_on.len(), 3);
        assert_eq!(config.start_options(), StartOptions::default());
    }

    #[test]
    fn parses_full_toml() {
        let config = NotifierConfig::from_toml_str(
            r#"
            table = "prices"
            encoding = "utf16_le"
            filter = "amount > 10"
            listen_on = ["Insert", "Update"]
            update_of = ["amount"]
            identity_conversion = "null_fill"
            heartbeat = false

            [culture]
            decimal_separator = ","
            group_separator = "."

            [reconnect]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.schema, "public");
        assert_eq!(config.encoding, TextEncoding::Utf16Le);
        assert_eq!(config.filter.as_deref(), Some("amount > 10"));
        assert_eq!(config.identity_conversion, IdentityConversionPolicy::NullFill);
        assert_eq!(config.culture.decimal_separator, ',');
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert!(!config.heartbeat);
    }

    #[test]
    fn rejects_invalid_configs() {
        assert!(NotifierConfig::from_toml_str("schema = \"public\"").is_err());
        assert!(NotifierConfig::from_toml_str("table = \"t\"\ntimeout_secs = 0").is_err());
        assert!(NotifierConfig::from_toml_str("table = \"t\"\nlisten_on = [\"None\"]").is_err());
        assert!(NotifierConfig::from_toml_str(
            "table = \"t\"\nlisten_on = [\"Insert\"]\nupdate_of = [\"a\"]"
        )
        .is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "table = \"orders\"\nwatchdog_timeout_secs = 600").unwrap();
        let config = NotifierConfig::load(file.path()).unwrap();
        assert_eq!(config.table, "orders");
        assert_eq!(config.start_options().watchdog_timeout, Duration::from_secs(600));
    }

    #[test]
    fn culture_normalizes_numbers() {
        let german = Culture {
            decimal_separator: ',',
            group_separator: Some('.'),
        };
        assert_eq!(german.normalize_number("1.234,5"), "1234.5");
        assert_eq!(german.localize_number("1234.5"), "1234,5");
        assert!(matches!(
            Culture::invariant().normalize_number("1.5"),
            Cow::Borrowed(_)
        ));
    }
}
