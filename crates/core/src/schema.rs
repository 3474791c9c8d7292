//! Schema model
//!
//! A [`Schema`] is an ordered list of [`ObjectSchema`]s. An empty schema means
//! "nothing known" and is never used to replace a known one.
//!
//! Comparing two schemas produces a list of [`SchemaChange`]s; whether a change
//! can be applied without a migration is decided by [`SchemaChange::is_additive`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{StrataError, StrataResult};

/// Type of one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    /// 64-bit integer
    Int,
    /// Boolean
    Bool,
    /// UTF-8 string
    String,
    /// 64-bit float
    Float,
    /// Link to an object of `object_type`
    Object,
    /// Computed backlinks from `object_type.link_origin_property`
    LinkingObjects,
}

impl PropertyType {
    /// Lowercase type name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::Int => "int",
            PropertyType::Bool => "bool",
            PropertyType::String => "string",
            PropertyType::Float => "float",
            PropertyType::Object => "object",
            PropertyType::LinkingObjects => "linking objects",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One property of an object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property name
    pub name: String,
    /// Property type
    pub property_type: PropertyType,
    /// Whether the property accepts null
    pub optional: bool,
    /// Whether the property is indexed
    pub indexed: bool,
    /// Whether the property is the primary key
    pub primary: bool,
    /// Target object type for `Object` and `LinkingObjects`
    pub object_type: Option<String>,
    /// Origin link property for `LinkingObjects`
    pub link_origin_property: Option<String>,
}

impl Property {
    /// A required scalar property
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Property {
            name: name.into(),
            property_type,
            optional: false,
            indexed: false,
            primary: false,
            object_type: None,
            link_origin_property: None,
        }
    }

    /// An optional link to `target`
    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        Property {
            optional: true,
            object_type: Some(target.into()),
            ..Property::new(name, PropertyType::Object)
        }
    }

    /// Backlinks from `origin_type.origin_property`
    pub fn linking_objects(
        name: impl Into<String>,
        origin_type: impl Into<String>,
        origin_property: impl Into<String>,
    ) -> Self {
        Property {
            object_type: Some(origin_type.into()),
            link_origin_property: Some(origin_property.into()),
            ..Property::new(name, PropertyType::LinkingObjects)
        }
    }

    /// Mark the property optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark the property indexed
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Mark the property as the primary key
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.indexed = true;
        self
    }

    /// Whether the property has storage (backlinks are computed)
    pub fn is_persisted(&self) -> bool {
        self.property_type != PropertyType::LinkingObjects
    }
}

/// Schema of one object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    /// Object type name
    pub name: String,
    /// Properties in declaration order
    pub properties: Vec<Property>,
}

impl ObjectSchema {
    /// Create an object schema
    pub fn new(name: impl Into<String>, properties: Vec<Property>) -> Self {
        ObjectSchema {
            name: name.into(),
            properties,
        }
    }

    /// Find a property by name
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Properties that have storage
    pub fn persisted_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| p.is_persisted())
    }

    /// The primary key property, if any
    pub fn primary_key(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.primary)
    }
}

/// One difference between an existing schema and a target schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Object type present only in the target
    AddTable(ObjectSchema),
    /// Property present only in the target
    AddProperty {
        /// Object type name
        object: String,
        /// The new property
        property: Property,
    },
    /// Property present only in the existing schema
    RemoveProperty {
        /// Object type name
        object: String,
        /// Property name
        property: String,
    },
    /// Property type or link target changed
    ChangePropertyType {
        /// Object type name
        object: String,
        /// Property name
        property: String,
        /// Existing type
        old_type: PropertyType,
        /// Target type
        new_type: PropertyType,
    },
    /// Required property became optional
    MakePropertyNullable {
        /// Object type name
        object: String,
        /// Property name
        property: String,
    },
    /// Optional property became required
    MakePropertyRequired {
        /// Object type name
        object: String,
        /// Property name
        property: String,
    },
    /// Index added or removed
    ChangeIndex {
        /// Object type name
        object: String,
        /// Property name
        property: String,
        /// Whether the property is indexed in the target
        indexed: bool,
    },
    /// Primary key changed
    ChangePrimaryKey {
        /// Object type name
        object: String,
        /// New primary key property, if any
        property: Option<String>,
    },
}

impl SchemaChange {
    /// Whether the change can be applied without a migration
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            SchemaChange::AddTable(_)
                | SchemaChange::AddProperty { .. }
                | SchemaChange::ChangeIndex { .. }
        )
    }

    /// Whether a versioned schema change is needed to apply this change
    ///
    /// New object types and index changes can be applied to a file at the
    /// same schema version.
    pub fn requires_migration(&self) -> bool {
        !matches!(
            self,
            SchemaChange::AddTable(_) | SchemaChange::ChangeIndex { .. }
        )
    }

    /// Human-readable description used in mismatch errors
    pub fn description(&self) -> String {
        match self {
            SchemaChange::AddTable(object) => {
                format!("Class '{}' has been added.", object.name)
            }
            SchemaChange::AddProperty { object, property } => {
                format!("Property '{}.{}' has been added.", object, property.name)
            }
            SchemaChange::RemoveProperty { object, property } => {
                format!("Property '{}.{}' has been removed.", object, property)
            }
            SchemaChange::ChangePropertyType {
                object,
                property,
                old_type,
                new_type,
            } => format!(
                "Property '{}.{}' has been changed from '{}' to '{}'.",
                object, property, old_type, new_type
            ),
            SchemaChange::MakePropertyNullable { object, property } => {
                format!("Property '{}.{}' has been made optional.", object, property)
            }
            SchemaChange::MakePropertyRequired { object, property } => {
                format!("Property '{}.{}' has been made required.", object, property)
            }
            SchemaChange::ChangeIndex {
                object,
                property,
                indexed,
            } => {
                if *indexed {
                    format!("Property '{}.{}' has been made indexed.", object, property)
                } else {
                    format!("Property '{}.{}' has been made unindexed.", object, property)
                }
            }
            SchemaChange::ChangePrimaryKey { object, property } => match property {
                Some(p) => format!("Primary key for class '{}' has changed to '{}'.", object, p),
                None => format!("Primary key for class '{}' has been removed.", object),
            },
        }
    }
}

/// Ordered collection of object schemas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    objects: Vec<ObjectSchema>,
}

impl Schema {
    /// Create a schema
    pub fn new(objects: Vec<ObjectSchema>) -> Self {
        Schema { objects }
    }

    /// The empty schema
    pub fn empty() -> Self {
        Schema::default()
    }

    /// Whether the schema knows no object types
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of object types
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Object schemas in declaration order
    pub fn objects(&self) -> &[ObjectSchema] {
        &self.objects
    }

    /// Find an object schema by name
    pub fn find(&self, name: &str) -> Option<&ObjectSchema> {
        self.objects.iter().find(|o| o.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut ObjectSchema> {
        self.objects.iter_mut().find(|o| o.name == name)
    }

    /// Validate the schema definition
    ///
    /// Every problem found is reported in one `InvalidSchema` error.
    pub fn validate(&self) -> StrataResult<()> {
        let mut errors = Vec::new();
        let mut seen_objects = HashSet::new();

        for object in &self.objects {
            if !seen_objects.insert(object.name.as_str()) {
                errors.push(format!("Type '{}' appears more than once in the schema.", object.name));
            }

            let mut seen_props = HashSet::new();
            let mut primary_count = 0;
            for prop in &object.properties {
                if !seen_props.insert(prop.name.as_str()) {
                    errors.push(format!(
                        "Property '{}.{}' appears more than once in the schema.",
                        object.name, prop.name
                    ));
                }
                if prop.primary {
                    primary_count += 1;
                }
                self.validate_property(object, prop, &mut errors);
            }
            if primary_count > 1 {
                errors.push(format!(
                    "Type '{}' has more than one primary key property.",
                    object.name
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StrataError::invalid_schema(errors.join(" ")))
        }
    }

    fn validate_property(&self, object: &ObjectSchema, prop: &Property, errors: &mut Vec<String>) {
        match prop.property_type {
            PropertyType::Object => match &prop.object_type {
                Some(target) if self.find(target).is_some() => {
                    if !prop.optional {
                        errors.push(format!(
                            "Property '{}.{}' of type 'object' must be nullable.",
                            object.name, prop.name
                        ));
                    }
                }
                Some(target) => errors.push(format!(
                    "Property '{}.{}' of type 'object' has unknown object type '{}'.",
                    object.name, prop.name, target
                )),
                None => errors.push(format!(
                    "Property '{}.{}' of type 'object' has no object type.",
                    object.name, prop.name
                )),
            },
            PropertyType::LinkingObjects => {
                let origin_type = prop.object_type.as_deref().unwrap_or_default();
                let origin_prop = prop.link_origin_property.as_deref().unwrap_or_default();
                let origin = match self.find(origin_type) {
                    Some(origin) => origin,
                    None => {
                        errors.push(format!(
                            "Property '{}.{}' of type 'linking objects' has unknown object type '{}'.",
                            object.name, prop.name, origin_type
                        ));
                        return;
                    }
                };
                match origin.property(origin_prop) {
                    None => errors.push(format!(
                        "Property '{}.{}' declared as origin of linking objects property '{}.{}' does not exist.",
                        origin_type, origin_prop, object.name, prop.name
                    )),
                    Some(link)
                        if link.property_type != PropertyType::Object
                            || link.object_type.as_deref() != Some(object.name.as_str()) =>
                    {
                        errors.push(format!(
                            "Property '{}.{}' declared as origin of linking objects property '{}.{}' is not a link to '{}'.",
                            origin_type, origin_prop, object.name, prop.name, object.name
                        ))
                    }
                    Some(_) => {}
                }
            }
            _ => {
                if prop.object_type.is_some() {
                    errors.push(format!(
                        "Property '{}.{}' of type '{}' cannot have an object type.",
                        object.name, prop.name, prop.property_type
                    ));
                }
            }
        }
    }

    /// Changes required to turn `self` (existing) into `target`
    ///
    /// Object types present only in `self` are not reported: a target schema
    /// may describe a subset of the file.
    pub fn compare(&self, target: &Schema) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        for target_object in &target.objects {
            let existing = match self.find(&target_object.name) {
                Some(existing) => existing,
                None => {
                    changes.push(SchemaChange::AddTable(target_object.clone()));
                    continue;
                }
            };
            let name = &target_object.name;

            for old in existing.persisted_properties() {
                let new = match target_object.property(&old.name) {
                    Some(new) if new.is_persisted() => new,
                    _ => {
                        changes.push(SchemaChange::RemoveProperty {
                            object: name.clone(),
                            property: old.name.clone(),
                        });
                        continue;
                    }
                };
                if old.property_type != new.property_type || old.object_type != new.object_type {
                    changes.push(SchemaChange::ChangePropertyType {
                        object: name.clone(),
                        property: old.name.clone(),
                        old_type: old.property_type,
                        new_type: new.property_type,
                    });
                    continue;
                }
                if !old.optional && new.optional {
                    changes.push(SchemaChange::MakePropertyNullable {
                        object: name.clone(),
                        property: old.name.clone(),
                    });
                } else if old.optional && !new.optional {
                    changes.push(SchemaChange::MakePropertyRequired {
                        object: name.clone(),
                        property: old.name.clone(),
                    });
                }
                if old.indexed != new.indexed && !new.primary && !old.primary {
                    changes.push(SchemaChange::ChangeIndex {
                        object: name.clone(),
                        property: old.name.clone(),
                        indexed: new.indexed,
                    });
                }
            }

            for new in target_object.persisted_properties() {
                if existing.property(&new.name).is_none() {
                    changes.push(SchemaChange::AddProperty {
                        object: name.clone(),
                        property: new.clone(),
                    });
                }
            }

            let old_pk = existing.primary_key().map(|p| p.name.clone());
            let new_pk = target_object.primary_key().map(|p| p.name.clone());
            if old_pk != new_pk {
                changes.push(SchemaChange::ChangePrimaryKey {
                    object: name.clone(),
                    property: new_pk,
                });
            }
        }

        changes
    }

    /// Whether `target` can be reached from `self` without a migration
    pub fn is_additive_to(&self, target: &Schema) -> bool {
        self.compare(target).iter().all(SchemaChange::is_additive)
    }

    /// Fail with `SchemaMismatch` listing every non-additive change
    pub fn check_additive(&self, target: &Schema) -> StrataResult<()> {
        let errors: Vec<String> = self
            .compare(target)
            .iter()
            .filter(|c| !c.is_additive())
            .map(SchemaChange::description)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StrataError::SchemaMismatch { errors })
        }
    }

    /// Replace the definitions of every object type that `target` declares
    ///
    /// Object types only known to `self` are kept.
    pub fn merge_from(&mut self, target: &Schema) {
        for object in &target.objects {
            match self.find_mut(&object.name) {
                Some(existing) => *existing = object.clone(),
                None => self.objects.push(object.clone()),
            }
        }
    }
}

impl Schema {
    /// `target` plus every persisted property only `self` still has
    ///
    /// Used when a schema is applied additively: columns the target no longer
    /// mentions stay in the file.
    pub fn additive_union(&self, target: &Schema) -> Schema {
        let mut merged = self.clone();
        for object in &target.objects {
            let mut combined = object.clone();
            if let Some(existing) = self.find(&object.name) {
                for property in existing.persisted_properties() {
                    if combined.property(&property.name).is_none() {
                        combined.properties.push(property.clone());
                    }
                }
            }
            merged.merge_from(&Schema::new(vec![combined]));
        }
        merged
    }
}

impl FromIterator<ObjectSchema> for Schema {
    fn from_iter<I: IntoIterator<Item = ObjectSchema>>(iter: I) -> Self {
        Schema::new(iter.into_iter().collect())
    }
}
