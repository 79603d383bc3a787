// ABOUTME: Entity model and the property-to-column mapper
// ABOUTME: Entities are built from converted records, never by reflection

pub mod entity;
pub mod mapper;

pub use entity::{ChangeEntity, FromValue, Property, Record, Value, ValueKind};
pub use mapper::{assemble, Assembled, ColumnBinding, ColumnDescriptor, ModelMapper};
