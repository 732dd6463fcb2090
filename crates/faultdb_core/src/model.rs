//! The in-process object model.
//!
//! A [`Model`] names every entity the engine may store, with its attributes,
//! relationships and validators. The model version is compared with the
//! store's schema version at open.

use crate::error::{CoreError, CoreResult};
use crate::row::RowValues;
use faultdb_codec::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Attribute-level validation function.
pub type AttributeValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Object-level validation function over the attribute values.
pub type ObjectValidatorFn = Arc<dyn Fn(&RowValues) -> Result<(), String> + Send + Sync>;

/// Scalar type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    /// 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// UTF-8 text.
    Text,
    /// Binary blob.
    Bytes,
    /// Milliseconds since the epoch.
    Timestamp,
}

impl AttributeType {
    /// Returns true if `value` is a non-null value of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (AttributeType::Integer, Value::Integer(_))
                | (AttributeType::Float, Value::Float(_) | Value::Integer(_))
                | (AttributeType::Boolean, Value::Bool(_))
                | (AttributeType::Text, Value::Text(_))
                | (AttributeType::Bytes, Value::Bytes(_))
                | (AttributeType::Timestamp, Value::Timestamp(_))
        )
    }

    /// The value read from an inaccessible fault under the lenient policy.
    #[must_use]
    pub fn empty_value(self) -> Value {
        match self {
            AttributeType::Integer => Value::Integer(0),
            AttributeType::Float => Value::Float(0.0),
            AttributeType::Boolean => Value::Bool(false),
            AttributeType::Text => Value::Text(String::new()),
            AttributeType::Bytes => Value::Bytes(Vec::new()),
            AttributeType::Timestamp => Value::Timestamp(0),
        }
    }

    /// Lowercase type name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Boolean => "boolean",
            AttributeType::Text => "text",
            AttributeType::Bytes => "bytes",
            AttributeType::Timestamp => "timestamp",
        }
    }
}

/// A constraint on one attribute value.
#[derive(Clone)]
pub enum ValidationRule {
    /// Minimum length of text or bytes.
    MinLength(usize),
    /// Maximum length of text or bytes.
    MaxLength(usize),
    /// Inclusive bounds, either side optional.
    Range {
        /// Lower bound.
        min: Option<Value>,
        /// Upper bound.
        max: Option<Value>,
    },
    /// Value must equal one of these.
    OneOf(Vec<Value>),
    /// Arbitrary check.
    Custom(AttributeValidatorFn),
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinLength(n) => f.debug_tuple("MinLength").field(n).finish(),
            Self::MaxLength(n) => f.debug_tuple("MaxLength").field(n).finish(),
            Self::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ValidationRule {
    /// Checks a non-null value against this rule.
    ///
    /// # Errors
    ///
    /// Returns the failure message.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let length = || match value {
            Value::Text(s) => Some(s.chars().count()),
            Value::Bytes(b) => Some(b.len()),
            _ => None,
        };
        match self {
            Self::MinLength(min) => match length() {
                Some(len) if len < *min => Err(format!("length {len} is below minimum {min}")),
                _ => Ok(()),
            },
            Self::MaxLength(max) => match length() {
                Some(len) if len > *max => Err(format!("length {len} exceeds maximum {max}")),
                _ => Ok(()),
            },
            Self::Range { min, max } => {
                if let Some(min) = min {
                    if value.cmp_total(min) == Ordering::Less {
                        return Err(format!("{value} is below minimum {min}"));
                    }
                }
                if let Some(max) = max {
                    if value.cmp_total(max) == Ordering::Greater {
                        return Err(format!("{value} exceeds maximum {max}"));
                    }
                }
                Ok(())
            }
            Self::OneOf(allowed) => {
                if allowed.iter().any(|a| a == value) {
                    Ok(())
                } else {
                    Err(format!("{value} is not an allowed value"))
                }
            }
            Self::Custom(check) => check(value),
        }
    }
}

/// Description of one attribute.
#[derive(Debug, Clone)]
pub struct AttributeDescription {
    /// Attribute name.
    pub name: String,
    /// Scalar type.
    pub attribute_type: AttributeType,
    /// Whether `Null` is allowed at save.
    pub optional: bool,
    /// Value given to new objects.
    pub default: Option<Value>,
    /// Additional constraints.
    pub rules: Vec<ValidationRule>,
}

impl AttributeDescription {
    /// Creates a required attribute without a default.
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            optional: false,
            default: None,
            rules: Vec::new(),
        }
    }

    /// Allows the attribute to be null.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the default value for inserted objects.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Adds a validation rule.
    #[must_use]
    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns every failure of `value` against this description.
    #[must_use]
    pub fn validate(&self, value: &Value) -> Vec<String> {
        if value.is_null() {
            return if self.optional {
                Vec::new()
            } else {
                vec!["is required".to_string()]
            };
        }
        if !self.attribute_type.accepts(value) {
            return vec![format!(
                "expected {}, found {}",
                self.attribute_type.name(),
                value.type_name()
            )];
        }
        self.rules
            .iter()
            .filter_map(|rule| rule.check(value).err())
            .collect()
    }
}

/// What deleting the source object does to a relationship's destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRule {
    /// Remove the source from each destination's inverse.
    #[default]
    Nullify,
    /// Delete every destination in the same context.
    Cascade,
    /// Refuse the save while destinations remain.
    Deny,
    /// Leave destinations untouched.
    NoAction,
}

/// Description of one relationship.
#[derive(Debug, Clone)]
pub struct RelationshipDescription {
    /// Relationship name.
    pub name: String,
    /// Destination entity name.
    pub destination: String,
    /// To-many if true, otherwise to-one.
    pub to_many: bool,
    /// Whether member order of a to-many relationship is meaningful.
    pub ordered: bool,
    /// Name of the inverse relationship on the destination.
    pub inverse: Option<String>,
    /// Delete propagation.
    pub delete_rule: DeleteRule,
    /// Whether an empty to-one is allowed at save.
    pub optional: bool,
}

impl RelationshipDescription {
    /// Creates an optional to-one relationship.
    pub fn to_one(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            to_many: false,
            ordered: false,
            inverse: None,
            delete_rule: DeleteRule::Nullify,
            optional: true,
        }
    }

    /// Creates a to-many relationship.
    pub fn to_many(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            to_many: true,
            ..Self::to_one(name, destination)
        }
    }

    /// Names the inverse relationship.
    #[must_use]
    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse = Some(name.into());
        self
    }

    /// Sets the delete rule.
    #[must_use]
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Marks a to-many relationship as ordered.
    #[must_use]
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Requires a to-one relationship to be set at save.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }
}

/// A property of an entity.
#[derive(Debug, Clone, Copy)]
pub enum Property<'a> {
    /// A scalar attribute.
    Attribute(&'a AttributeDescription),
    /// A relationship.
    Relationship(&'a RelationshipDescription),
}

/// Description of one entity kind.
#[derive(Clone)]
pub struct EntityDescription {
    /// Entity name.
    pub name: String,
    /// Attributes in declaration order.
    pub attributes: Vec<AttributeDescription>,
    /// Relationships in declaration order.
    pub relationships: Vec<RelationshipDescription>,
    /// Object-level validators.
    pub validators: Vec<ObjectValidatorFn>,
}

impl fmt::Debug for EntityDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescription")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("relationships", &self.relationships)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl EntityDescription {
    /// Creates an entity with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            validators: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds a relationship.
    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipDescription) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Adds an object-level validator.
    #[must_use]
    pub fn validator<F>(mut self, check: F) -> Self
    where
        F: Fn(&RowValues) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(check));
        self
    }

    /// Looks up an attribute.
    #[must_use]
    pub fn attribute_named(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up a relationship.
    #[must_use]
    pub fn relationship_named(&self, name: &str) -> Option<&RelationshipDescription> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Looks up any property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAttribute`] if the name is not declared.
    pub fn property(&self, name: &str) -> CoreResult<Property<'_>> {
        if let Some(attribute) = self.attribute_named(name) {
            return Ok(Property::Attribute(attribute));
        }
        self.relationship_named(name)
            .map(Property::Relationship)
            .ok_or_else(|| CoreError::unknown_attribute(&self.name, name))
    }

    /// Initial attribute values of a newly inserted object.
    #[must_use]
    pub fn initial_values(&self) -> RowValues {
        self.attributes
            .iter()
            .map(|a| (a.name.clone(), a.default.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// Runs attribute and object validators.
    ///
    /// Returns `(attribute, message)` pairs; `None` marks object-level failures.
    #[must_use]
    pub fn validate_values(&self, values: &RowValues) -> Vec<(Option<String>, String)> {
        let mut failures = Vec::new();
        for attribute in &self.attributes {
            let value = values.get(&attribute.name).unwrap_or(&Value::Null);
            for message in attribute.validate(value) {
                failures.push((Some(attribute.name.clone()), message));
            }
        }
        for check in &self.validators {
            if let Err(message) = check(values) {
                failures.push((None, message));
            }
        }
        failures
    }
}

/// A versioned set of entity descriptions.
#[derive(Debug, Clone)]
pub struct Model {
    version: u32,
    entities: Vec<Arc<EntityDescription>>,
}

impl Model {
    /// Creates an empty model at `version`.
    #[must_use]
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: Vec::new(),
        }
    }

    /// Adds an entity.
    #[must_use]
    pub fn entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(Arc::new(entity));
        self
    }

    /// Schema version of this model.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// All entities.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescription>> {
        self.entities.iter()
    }

    /// Looks up an entity by name.
    #[must_use]
    pub fn entity_named(&self, name: &str) -> Option<&Arc<EntityDescription>> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for duplicate names, dangling
    /// destinations or inverses that do not point back.
    pub fn check(&self) -> CoreResult<()> {
        let mut names = HashSet::new();
        for entity in &self.entities {
            if !names.insert(entity.name.as_str()) {
                return Err(CoreError::invalid_operation(format!(
                    "duplicate entity {}",
                    entity.name
                )));
            }
            let mut properties = HashSet::new();
            let all = entity
                .attributes
                .iter()
                .map(|a| a.name.as_str())
                .chain(entity.relationships.iter().map(|r| r.name.as_str()));
            for property in all {
                if !properties.insert(property) {
                    return Err(CoreError::invalid_operation(format!(
                        "duplicate property {}.{property}",
                        entity.name
                    )));
                }
            }
        }

        for entity in &self.entities {
            for relationship in &entity.relationships {
                let destination = self.entity_named(&relationship.destination).ok_or_else(|| {
                    CoreError::invalid_operation(format!(
                        "{}.{} points at unknown entity {}",
                        entity.name, relationship.name, relationship.destination
                    ))
                })?;
                if let Some(inverse) = &relationship.inverse {
                    let back = destination.relationship_named(inverse).ok_or_else(|| {
                        CoreError::invalid_operation(format!(
                            "inverse {}.{inverse} does not exist",
                            destination.name
                        ))
                    })?;
                    if back.destination != entity.name
                        || back.inverse.as_deref() != Some(relationship.name.as_str())
                    {
                        return Err(CoreError::invalid_operation(format!(
                            "{}.{} and {}.{inverse} are not mutual inverses",
                            entity.name, relationship.name, destination.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
