//! Write transactions
//!
//! A [`WriteTransaction`] is a private working copy of the latest snapshot.
//! Nothing it does is visible until it is committed through
//! [`Storage::commit`](crate::Storage::commit); dropping it discards every change.

use std::collections::BTreeMap;

use strata_core::{
    ObjectSchema, Property, Query, Schema, StrataError, StrataResult, Value, VersionClock,
};

use crate::snapshot::{Object, RowKey, Snapshot, Table};

/// Uncommitted changes on top of a base snapshot
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    base: VersionClock,
    schema: Schema,
    schema_version: u64,
    tables: BTreeMap<String, Table>,
    schema_changed: bool,
    wiped: bool,
}

impl WriteTransaction {
    /// Start a working copy of `base`
    pub fn new(base: &Snapshot) -> Self {
        WriteTransaction {
            base: base.version,
            schema: base.schema.clone(),
            schema_version: base.version.schema_version,
            tables: base.tables.clone(),
            schema_changed: false,
            wiped: false,
        }
    }

    /// Version this transaction was started from
    pub fn base_version(&self) -> VersionClock {
        self.base
    }

    /// Schema as modified so far
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Schema version that will be committed
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    /// Whether the schema definition changed in this transaction
    pub fn schema_changed(&self) -> bool {
        self.schema_changed || self.schema_version != self.base.schema_version
    }

    /// Whether [`clear`](Self::clear) was called
    pub fn was_wiped(&self) -> bool {
        self.wiped
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Create an object, filling unspecified properties with defaults
    pub fn create_object(
        &mut self,
        object_type: &str,
        values: impl IntoIterator<Item = (String, Value)>,
    ) -> StrataResult<RowKey> {
        let object_schema = self.object_schema(object_type)?.clone();
        let mut object = default_object(&object_schema);
        for (name, value) in values {
            check_value(&object_schema, &name, &value)?;
            object.insert(name, value);
        }

        let table = self.tables.entry(object_type.to_string()).or_default();
        let key = table.allocate_key();
        table.rows.insert(key, object);
        Ok(key)
    }

    /// Set one property of an existing object
    pub fn set_value(
        &mut self,
        object_type: &str,
        key: RowKey,
        property: &str,
        value: Value,
    ) -> StrataResult<()> {
        let object_schema = self.object_schema(object_type)?;
        check_value(object_schema, property, &value)?;
        let object = self
            .tables
            .get_mut(object_type)
            .and_then(|t| t.rows.get_mut(&key))
            .ok_or_else(|| {
                StrataError::storage(format!("object {} of type '{}' not found", key, object_type))
            })?;
        object.insert(property.to_string(), value);
        Ok(())
    }

    /// Delete an object; returns whether it existed
    pub fn delete_object(&mut self, object_type: &str, key: RowKey) -> bool {
        self.tables
            .get_mut(object_type)
            .map(|t| t.rows.remove(&key).is_some())
            .unwrap_or(false)
    }

    /// Delete every object of a type
    pub fn delete_all(&mut self, object_type: &str) {
        if let Some(table) = self.tables.get_mut(object_type) {
            table.rows.clear();
        }
    }

    /// Number of objects of a type
    pub fn object_count(&self, object_type: &str) -> usize {
        self.tables.get(object_type).map(Table::len).unwrap_or(0)
    }

    /// Keys of every object of a type in insertion order
    pub fn keys(&self, object_type: &str) -> Vec<RowKey> {
        self.tables
            .get(object_type)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Value of one property of one object
    pub fn get_value(&self, object_type: &str, key: RowKey, property: &str) -> Option<&Value> {
        self.tables.get(object_type)?.get(key)?.get(property)
    }

    /// Evaluate a query against the uncommitted state
    pub fn evaluate(&self, query: &Query) -> Vec<(RowKey, &Object)> {
        crate::snapshot::evaluate(&self.tables, query)
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Add a new object type
    pub fn add_object_type(&mut self, object: ObjectSchema) -> StrataResult<()> {
        if self.schema.find(&object.name).is_some() {
            return Err(StrataError::invalid_schema(format!(
                "Type '{}' already exists",
                object.name
            )));
        }
        self.tables.entry(object.name.clone()).or_default();
        self.schema.merge_from(&Schema::new(vec![object]));
        self.schema_changed = true;
        Ok(())
    }

    /// Add a property to an existing object type
    pub fn add_property(&mut self, object_type: &str, property: Property) -> StrataResult<()> {
        let mut object = self.object_schema(object_type)?.clone();
        if object.property(&property.name).is_some() {
            return Err(StrataError::invalid_schema(format!(
                "Property '{}.{}' already exists",
                object_type, property.name
            )));
        }
        object.properties.push(property);
        self.replace_object_schema(object);
        Ok(())
    }

    /// Remove a property from an existing object type
    pub fn remove_property(&mut self, object_type: &str, name: &str) -> StrataResult<()> {
        let mut object = self.object_schema(object_type)?.clone();
        if object.property(name).is_none() {
            return Err(StrataError::invalid_schema(format!(
                "Property '{}.{}' does not exist",
                object_type, name
            )));
        }
        object.properties.retain(|p| p.name != name);
        self.replace_object_schema(object);
        Ok(())
    }

    /// Bring the schema to `target`, rewriting tables to match
    ///
    /// Types only present in the current schema are kept. Returns whether
    /// anything changed.
    pub fn set_schema(&mut self, target: &Schema) -> bool {
        if self.schema.compare(target).is_empty() {
            return false;
        }
        let mut merged = self.schema.clone();
        merged.merge_from(target);
        for object in target.objects() {
            let table = self.tables.entry(object.name.clone()).or_default();
            reconcile_table(object, table);
        }
        self.schema = merged;
        self.schema_changed = true;
        true
    }

    /// Set the schema version that will be committed
    pub fn set_schema_version(&mut self, schema_version: u64) {
        self.schema_version = schema_version;
    }

    /// Remove every object type and object
    pub fn clear(&mut self) {
        self.tables.clear();
        self.schema = Schema::empty();
        self.schema_changed = true;
        self.wiped = true;
    }

    pub(crate) fn into_snapshot(self, version: VersionClock) -> Snapshot {
        Snapshot {
            version,
            schema: self.schema,
            tables: self.tables,
        }
    }

    fn object_schema(&self, object_type: &str) -> StrataResult<&ObjectSchema> {
        self.schema.find(object_type).ok_or_else(|| {
            StrataError::storage(format!("Object type '{}' is not in the schema", object_type))
        })
    }

    fn replace_object_schema(&mut self, object: ObjectSchema) {
        let table = self.tables.entry(object.name.clone()).or_default();
        reconcile_table(&object, table);
        self.schema.merge_from(&Schema::new(vec![object]));
        self.schema_changed = true;
    }
}

fn default_object(object: &ObjectSchema) -> Object {
    object
        .persisted_properties()
        .map(|p| {
            let value = if p.optional {
                Value::Null
            } else {
                Value::default_for(p.property_type)
            };
            (p.name.clone(), value)
        })
        .collect()
}

fn check_value(object: &ObjectSchema, name: &str, value: &Value) -> StrataResult<()> {
    let property = object
        .property(name)
        .filter(|p| p.is_persisted())
        .ok_or_else(|| {
            StrataError::storage(format!("Property '{}.{}' does not exist", object.name, name))
        })?;
    if !value.matches_type(property.property_type, property.optional) {
        return Err(StrataError::storage(format!(
            "Property '{}.{}' of type '{}' cannot hold {}",
            object.name, name, property.property_type, value
        )));
    }
    Ok(())
}

/// Drop columns the schema no longer has, add missing ones with defaults,
/// reset values that no longer fit their property
fn reconcile_table(object: &ObjectSchema, table: &mut Table) {
    let defaults = default_object(object);
    for row in table.rows.values_mut() {
        row.retain(|name, _| defaults.contains_key(name));
        for property in object.persisted_properties() {
            let fits = row
                .get(&property.name)
                .map(|v| v.matches_type(property.property_type, property.optional))
                .unwrap_or(false);
            if !fits {
                row.insert(property.name.clone(), defaults[&property.name].clone());
            }
        }
    }
}
