// ABOUTME: Model Mapper: static projection of entity properties onto table columns
// ABOUTME: Explicit overrides first, then case- and space-insensitive name matching

use std::collections::{BTreeMap, HashMap};

use crate::config::IdentityConversionPolicy;
use crate::error::NotifierError;
use crate::marshal::{ColumnType, Dialect, Marshaler};
use crate::protocol::ClosedRecord;

use super::entity::{ChangeEntity, Property, Record};

/// Column metadata read from the backing store at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared type exactly as the store reports it
    pub type_name: String,
    pub ordinal: u32,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, ordinal: u32) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ordinal,
            nullable: true,
        }
    }
}

/// A property resolved to its column and canonical column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub property: Property,
    pub column: ColumnDescriptor,
    pub column_type: ColumnType,
}

/// Result of converting one closed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub record: Record,
    /// Conversion faults of properties that were left null
    pub faults: Vec<NotifierError>,
}

#[derive(Debug, Clone)]
pub struct ModelMapper {
    properties: &'static [Property],
    mappings: BTreeMap<String, String>,
}

impl ModelMapper {
    pub fn new(properties: &'static [Property]) -> Self {
        Self {
            properties,
            mappings: BTreeMap::new(),
        }
    }

    pub fn for_entity<E: ChangeEntity>() -> Self {
        Self::new(E::properties())
    }

    pub fn properties(&self) -> &'static [Property] {
        self.properties
    }

    /// Register an explicit property -> column override.
    pub fn add_mapping(
        &mut self,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Result<(), NotifierError> {
        let property = property.into();
        let column = column.into();

        if !self.properties.iter().any(|p| p.name == property) {
            return Err(NotifierError::UnknownProperty { property });
        }
        if self.mappings.contains_key(&property) {
            return Err(NotifierError::DuplicateMapping { property });
        }
        if let Some((owner, _)) = self
            .mappings
            .iter()
            .find(|(_, mapped)| mapped.eq_ignore_ascii_case(&column))
        {
            return Err(NotifierError::ColumnAlreadyMapped {
                column,
                property: owner.clone(),
            });
        }

        self.mappings.insert(property, column);
        Ok(())
    }

    /// Explicit column override of a property, if one was registered.
    pub fn mapped_column(&self, property: &str) -> Option<&str> {
        self.mappings.get(property).map(String::as_str)
    }

    /// Find the column a property reads from.
    ///
    /// Order: explicit mapping, case-insensitive name, then a match that also
    /// ignores spaces and underscores.
    pub fn resolve<'c>(
        &self,
        property: &str,
        columns: &'c [ColumnDescriptor],
    ) -> Option<&'c ColumnDescriptor> {
        if let Some(mapped) = self.mapped_column(property) {
            return columns
                .iter()
                .find(|c| c.name == mapped)
                .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case(mapped)));
        }

        if let Some(column) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(property)) {
            return Some(column);
        }

        let wanted = normalize_name(property);
        columns.iter().find(|c| normalize_name(&c.name) == wanted)
    }

    /// Resolve every property against the table, rejecting unsupported column types.
    ///
    /// Properties with no column are left out, except identity properties
    /// which must resolve.
    pub fn bind(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        dialect: &Dialect,
    ) -> Result<Vec<ColumnBinding>, NotifierError> {
        let mut bindings: Vec<ColumnBinding> = Vec::new();
        let mut claimed: HashMap<&str, &str> = HashMap::new();

        for property in self.properties {
            let Some(column) = self.resolve(property.name, columns) else {
                if property.identity {
                    return Err(NotifierError::NoMatchBetweenModelAndColumn {
                        table: table.to_string(),
                        property: property.name.to_string(),
                    });
                }
                tracing::debug!(
                    table = %table,
                    property = property.name,
                    "Property has no matching column, excluded from change events"
                );
                continue;
            };

            if let Some(owner) = claimed.insert(column.name.as_str(), property.name) {
                return Err(NotifierError::ColumnAlreadyMapped {
                    column: column.name.clone(),
                    property: owner.to_string(),
                });
            }

            let column_type = dialect.column_type(&column.type_name).ok_or_else(|| {
                NotifierError::ColumnTypeNotSupported {
                    table: table.to_string(),
                    column: column.name.clone(),
                    type_name: column.type_name.clone(),
                }
            })?;

            bindings.push(ColumnBinding {
                property: *property,
                column: column.clone(),
                column_type,
            });
        }

        if bindings.is_empty() {
            return Err(NotifierError::Config(format!(
                "no model property matches a column of '{}'",
                table
            )));
        }

        bindings.sort_by_key(|binding| binding.column.ordinal);
        Ok(bindings)
    }
}

/// Convert a closed record into property values.
///
/// A failed identity property drops the record under `Abort`; every other
/// failed property is left null and its fault returned alongside.
pub fn assemble(
    bindings: &[ColumnBinding],
    closed: &ClosedRecord,
    marshaler: &Marshaler,
    policy: IdentityConversionPolicy,
) -> Result<Assembled, NotifierError> {
    let mut record = Record::new();
    let mut faults = Vec::new();

    for binding in bindings {
        let payload = closed.payload(&binding.column.name);
        match marshaler.convert_column(payload, binding.column_type, binding.property.kind) {
            Ok(value) => record.insert(binding.property.name, value),
            Err(err) => {
                let fault = NotifierError::Conversion {
                    property: binding.property.name.to_string(),
                    column: binding.column.name.clone(),
                    type_name: binding.column.type_name.clone(),
                    reason: err.to_string(),
                };
                if binding.property.identity && policy == IdentityConversionPolicy::Abort {
                    return Err(fault);
                }
                faults.push(fault);
                record.insert(binding.property.name, None);
            }
        }
    }

    Ok(Assembled { record, faults })
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != ' ' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
