//! # Type and Field Registry
//!
//! Schema descriptors for the records a collection stores. A [`TypeSpec`] is
//! addressed `namespace/name@version`; its fields are addressed
//! `namespace/name@version#field`.
//!
//! A field may *refine* a parent field, meaning "is a more specific variant
//! of". Refinement forms a tree, and lookups must match the whole chain: a
//! query against the parent field also sees values indexed under any
//! refining descendant.
//!
//! The registry is an explicit, owned object handed to every component that
//! resolves types - there is no ambient global state. It is assembled before
//! the collection opens and immutable afterwards, so readers share it
//! without locking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::RecordVersion;

// =============================================================================
// Specs
// =============================================================================

/// Index options for one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOpts {
    /// Maintain a value -> record index in the fields view.
    #[serde(default)]
    pub basic: bool,
    /// Hand the field to the full-text view. Recorded here; the full-text
    /// internals are a pluggable view outside this crate.
    #[serde(default)]
    pub search: bool,
}

/// One field of a record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name; also the top-level key in record values.
    pub name: String,
    /// Full address of the parent field this one refines, if any.
    #[serde(default)]
    pub refines: Option<String>,
    /// Index declarations driving the fields view.
    #[serde(default)]
    pub index: IndexOpts,
}

/// A record type: `namespace/name@version` plus its field descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSpec {
    /// Namespace, e.g. `weftdb` or an application name.
    pub namespace: String,
    /// Type name within the namespace.
    pub name: String,
    /// Schema version; bumped on breaking field changes.
    pub version: u32,
    /// Field descriptors.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl TypeSpec {
    /// The fully-qualified type address (`namespace/name@version`).
    pub fn addr(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.version)
    }

    /// The address of one of this type's fields.
    pub fn field_addr(&self, field: &str) -> String {
        format!("{}#{}", self.addr(), field)
    }
}

/// Splits a field address into its type address and field name.
pub fn split_field_addr(addr: &str) -> Result<(&str, &str)> {
    addr.split_once('#')
        .ok_or_else(|| Error::NotFound(format!("bad field address: {addr}")))
}

// =============================================================================
// Registry
// =============================================================================

/// The collection's schema: every known type, plus the field refinement
/// tree derived from their `refines` declarations.
#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<String, TypeSpec>,
    /// parent field address -> directly refining field addresses.
    children: HashMap<String, Vec<String>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type.
    ///
    /// Fails with [`Error::Invalid`] if the address is already taken or a
    /// field refines an unknown parent. Parents must therefore be defined
    /// before their refinements.
    pub fn define(&mut self, spec: TypeSpec) -> Result<()> {
        let addr = spec.addr();
        if self.types.contains_key(&addr) {
            return Err(Error::Invalid(format!("type {addr} already defined")));
        }
        for field in &spec.fields {
            if let Some(parent) = &field.refines {
                if !self.field_exists(parent) {
                    return Err(Error::Invalid(format!(
                        "field {} refines unknown field {parent}",
                        spec.field_addr(&field.name)
                    )));
                }
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(spec.field_addr(&field.name));
            }
        }
        self.types.insert(addr, spec);
        Ok(())
    }

    /// Looks up a type by its full address.
    pub fn get(&self, addr: &str) -> Option<&TypeSpec> {
        self.types.get(addr)
    }

    /// True if the given field address names a defined field.
    pub fn field_exists(&self, field_addr: &str) -> bool {
        let Ok((type_addr, field)) = split_field_addr(field_addr) else {
            return false;
        };
        self.types
            .get(type_addr)
            .map(|t| t.fields.iter().any(|f| f.name == field))
            .unwrap_or(false)
    }

    /// The field address plus every address refining it, transitively.
    ///
    /// This is the set a parent-field query must scan: values stored under a
    /// refining child belong to every ancestor's result set.
    pub fn field_with_descendants(&self, field_addr: &str) -> Vec<String> {
        let mut out = vec![field_addr.to_string()];
        let mut i = 0;
        while i < out.len() {
            if let Some(kids) = self.children.get(&out[i]) {
                out.extend(kids.iter().cloned());
            }
            i += 1;
        }
        out
    }

    /// The `basic`-indexed fields of a type, as `(field address, spec)`.
    pub fn indexed_fields(&self, type_addr: &str) -> Vec<(String, &FieldSpec)> {
        let Some(spec) = self.types.get(type_addr) else {
            return Vec::new();
        };
        spec.fields
            .iter()
            .filter(|f| f.index.basic)
            .map(|f| (spec.field_addr(&f.name), f))
            .collect()
    }

    /// Resolves a decoded record against the schema.
    ///
    /// Fails with [`Error::Invalid`] for an unknown type. On the query path
    /// the caller logs and drops the record instead of surfacing the error;
    /// on the commit path the error aborts the batch.
    pub fn upcast<'a>(&'a self, version: &RecordVersion) -> Result<&'a TypeSpec> {
        self.get(&version.typ)
            .ok_or_else(|| Error::Invalid(format!("unknown type {}", version.typ)))
    }

    /// Extracts a field's value from a record payload, if present.
    pub fn field_value<'v>(&self, value: &'v Value, field_name: &str) -> Option<&'v Value> {
        value.as_object()?.get(field_name)
    }
}

// =============================================================================
// Tests
// =============================================================================
