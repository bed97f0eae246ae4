//! Field schemas: which names an expression may reference, and how each
//! entity exposes its values.

use std::borrow::Cow;
use std::fmt;

use fleetgrid_state::{Rollout, Target, TargetFilterQuery};

/// The entity kind an expression is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    Target,
    FilterQuery,
    Rollout,
}

/// A resolved field reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    // Target
    ControllerId,
    Name,
    Description,
    Address,
    UpdateStatus,
    CreatedAt,
    LastModifiedAt,
    LastControllerRequestAt,
    UpdateLocked,
    AssignedDs,
    InstalledDs,
    Attribute(String),
    // Filter query / rollout
    Id,
    Query,
    AutoAssignDs,
    Status,
    DistributionSet,
    TotalTargets,
}

/// How literals for a field are typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text,
    Number,
    Bool,
    /// Text restricted to a closed set of upper-case names.
    Enum(&'static [&'static str]),
}

pub(crate) const TARGET_UPDATE_STATUSES: &[&str] =
    &["UNKNOWN", "REGISTERED", "PENDING", "IN_SYNC", "ERROR"];

pub(crate) const ROLLOUT_STATUSES: &[&str] = &[
    "CREATING", "READY", "STARTING", "RUNNING", "PAUSED", "FINISHED", "ERROR", "STOPPED",
];

impl Schema {
    /// Resolve a field name (case-insensitive) in this schema.
    pub fn resolve(&self, name: &str) -> Option<Field> {
        let lower = name.to_ascii_lowercase();
        let field = match self {
            Schema::Target => {
                if let Some(key) = lower.strip_prefix("attribute.") {
                    // Attribute keys keep their original spelling.
                    let key = &name[name.len() - key.len()..];
                    return (!key.is_empty()).then(|| Field::Attribute(key.to_string()));
                }
                match lower.as_str() {
                    "controllerid" | "id" => Field::ControllerId,
                    "name" => Field::Name,
                    "description" => Field::Description,
                    "address" | "ipaddress" => Field::Address,
                    "updatestatus" | "status" => Field::UpdateStatus,
                    "createdat" => Field::CreatedAt,
                    "lastmodifiedat" => Field::LastModifiedAt,
                    "lastcontrollerrequestat" => Field::LastControllerRequestAt,
                    "updatelocked" => Field::UpdateLocked,
                    "assignedds" => Field::AssignedDs,
                    "installedds" => Field::InstalledDs,
                    _ => return None,
                }
            }
            Schema::FilterQuery => match lower.as_str() {
                "id" => Field::Id,
                "name" => Field::Name,
                "query" => Field::Query,
                "autoassignds" => Field::AutoAssignDs,
                _ => return None,
            },
            Schema::Rollout => match lower.as_str() {
                "id" => Field::Id,
                "name" => Field::Name,
                "status" => Field::Status,
                "distributionset" => Field::DistributionSet,
                "totaltargets" => Field::TotalTargets,
                _ => return None,
            },
        };
        Some(field)
    }

    /// Type of `field` within this schema.
    pub fn value_type(&self, field: &Field) -> ValueType {
        match field {
            Field::CreatedAt
            | Field::LastModifiedAt
            | Field::LastControllerRequestAt
            | Field::AssignedDs
            | Field::InstalledDs
            | Field::Id
            | Field::AutoAssignDs
            | Field::DistributionSet
            | Field::TotalTargets => ValueType::Number,
            Field::UpdateLocked => ValueType::Bool,
            Field::UpdateStatus => ValueType::Enum(TARGET_UPDATE_STATUSES),
            Field::Status => ValueType::Enum(ROLLOUT_STATUSES),
            Field::ControllerId
            | Field::Name
            | Field::Description
            | Field::Address
            | Field::Attribute(_)
            | Field::Query => ValueType::Text,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::ControllerId => "controllerId",
            Field::Name => "name",
            Field::Description => "description",
            Field::Address => "address",
            Field::UpdateStatus => "updateStatus",
            Field::CreatedAt => "createdAt",
            Field::LastModifiedAt => "lastModifiedAt",
            Field::LastControllerRequestAt => "lastControllerRequestAt",
            Field::UpdateLocked => "updateLocked",
            Field::AssignedDs => "assignedDs",
            Field::InstalledDs => "installedDs",
            Field::Attribute(key) => return write!(f, "attribute.{key}"),
            Field::Id => "id",
            Field::Query => "query",
            Field::AutoAssignDs => "autoAssignDs",
            Field::Status => "status",
            Field::DistributionSet => "distributionSet",
            Field::TotalTargets => "totalTargets",
        };
        f.write_str(name)
    }
}

/// A field value read from an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Text(Cow<'a, str>),
    Number(u64),
    Bool(bool),
}

/// An entity a filter can be evaluated against.
pub trait Filterable {
    const SCHEMA: Schema;

    /// The value of `field`, or `None` when the entity has no value for it.
    fn field_value(&self, field: &Field) -> Option<FieldValue<'_>>;
}

fn text(s: &str) -> Option<FieldValue<'_>> {
    Some(FieldValue::Text(Cow::Borrowed(s)))
}

impl Filterable for Target {
    const SCHEMA: Schema = Schema::Target;

    fn field_value(&self, field: &Field) -> Option<FieldValue<'_>> {
        match field {
            Field::ControllerId => text(&self.controller_id),
            Field::Name => text(&self.name),
            Field::Description => self.description.as_deref().and_then(text),
            Field::Address => self.address.as_deref().and_then(text),
            Field::UpdateStatus => text(self.update_status.as_str()),
            Field::CreatedAt => Some(FieldValue::Number(self.created_at)),
            Field::LastModifiedAt => Some(FieldValue::Number(self.last_modified_at)),
            Field::LastControllerRequestAt => self.last_contact_at.map(FieldValue::Number),
            Field::UpdateLocked => Some(FieldValue::Bool(self.update_locked)),
            Field::AssignedDs => self.assigned_ds.map(FieldValue::Number),
            Field::InstalledDs => self.installed_ds.map(FieldValue::Number),
            Field::Attribute(key) => self.attributes.get(key).and_then(|v| text(v)),
            _ => None,
        }
    }
}

impl Filterable for TargetFilterQuery {
    const SCHEMA: Schema = Schema::FilterQuery;

    fn field_value(&self, field: &Field) -> Option<FieldValue<'_>> {
        match field {
            Field::Id => Some(FieldValue::Number(self.id)),
            Field::Name => text(&self.name),
            Field::Query => text(&self.query),
            Field::AutoAssignDs => self.auto_assign_ds.map(FieldValue::Number),
            _ => None,
        }
    }
}

impl Filterable for Rollout {
    const SCHEMA: Schema = Schema::Rollout;

    fn field_value(&self, field: &Field) -> Option<FieldValue<'_>> {
        match field {
            Field::Id => Some(FieldValue::Number(self.id)),
            Field::Name => text(&self.name),
            Field::Status => text(self.status.as_str()),
            Field::DistributionSet => Some(FieldValue::Number(self.distribution_set_id)),
            Field::TotalTargets => Some(FieldValue::Number(self.total_targets)),
            _ => None,
        }
    }
}
