//! Raw resource definition types matching the JSON definition documents.

use crate::sql::{Direction, Operator};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Integer,
    BigInt,
    Float,
    Boolean,
    Timestamp,
    Date,
    Uuid,
    Json,
}

impl FieldType {
    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::BigInt)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::BigInt | FieldType::Float)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Text)
    }
}

/// Server-side generated defaults. A closed set so DDL never embeds caller-written SQL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generator {
    Uuid,
    Now,
    Increment,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DefaultValue {
    Literal(serde_json::Value),
    Generated(Generator),
}

impl<'de> Deserialize<'de> for DefaultValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::Object(mut obj) => {
                if let Some(generated) = obj.remove("generated") {
                    let generator: Generator =
                        serde_json::from_value(generated).map_err(serde::de::Error::custom)?;
                    return Ok(DefaultValue::Generated(generator));
                }
                if let Some(lit) = obj.remove("value") {
                    return Ok(DefaultValue::Literal(lit));
                }
                Err(serde::de::Error::custom(format!(
                    "default must be a literal, {{ \"generated\": \"uuid|now|increment\" }}, or {{ \"value\": ... }}; got object with keys: {:?}",
                    obj.keys().collect::<Vec<_>>()
                )))
            }
            other => Ok(DefaultValue::Literal(other)),
        }
    }
}

impl Serialize for DefaultValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DefaultValue::Literal(v) => serde_json::json!({ "value": v }).serialize(serializer),
            DefaultValue::Generated(g) => serde_json::json!({ "generated": g }).serialize(serializer),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    #[serde(default, alias = "minimum", skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, alias = "maximum", skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    /// Exactly one of `required` / `optional` decides nullability; neither is an error.
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub optional: Option<bool>,
    #[serde(flatten)]
    pub constraints: FieldConstraints,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl CascadePolicy {
    pub fn sql(&self) -> &'static str {
        match self {
            CascadePolicy::Cascade => "CASCADE",
            CascadePolicy::Restrict => "RESTRICT",
            CascadePolicy::SetNull => "SET NULL",
            CascadePolicy::SetDefault => "SET DEFAULT",
            CascadePolicy::NoAction => "NO ACTION",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKindName {
    #[serde(alias = "belongs_to")]
    OwningReference,
    #[serde(alias = "has_many")]
    OwnedCollection,
    #[serde(alias = "has_one")]
    OwnedSingle,
    #[serde(alias = "many_to_many")]
    CollectionThroughJoin,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderDefinition {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub name: String,
    pub kind: RelationshipKindName,
    pub target: String,
    /// Declaring side for owning references; target side for owned kinds; join-table column for join kinds.
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub on_delete: Option<CascadePolicy>,
    #[serde(default)]
    pub on_update: Option<CascadePolicy>,
    #[serde(default)]
    pub join_table: Option<String>,
    #[serde(default)]
    pub association_key: Option<String>,
    #[serde(default)]
    pub order_by: Option<OrderDefinition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Scope operand: a literal, or a reference to one of the scope's parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeOperand {
    Param { param: String },
    Literal(serde_json::Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopeCondition {
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Option<ScopeOperand>,
    /// Joined to the previous condition with OR instead of AND.
    #[serde(default)]
    pub or: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub conditions: Vec<ScopeCondition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl HookPoint {
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            HookPoint::BeforeCreate | HookPoint::BeforeUpdate | HookPoint::BeforeDelete
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookBinding {
    pub point: HookPoint,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    /// Table name; defaults to the resource name.
    #[serde(default)]
    pub table: Option<String>,
    /// PostgreSQL schema; defaults to the registry's schema.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub scopes: Vec<ScopeDefinition>,
    #[serde(default)]
    pub hooks: Vec<HookBinding>,
    /// Names of procedural resource-level validators.
    #[serde(default)]
    pub validators: Vec<String>,
}

fn default_primary_key() -> String {
    "id".into()
}
