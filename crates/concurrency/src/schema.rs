//! Schema snapshots and per-request schema views
//!
//! # Design
//!
//! - `SchemaSnapshot` is an immutable, versioned definition shared through
//!   the `SchemaStore` as an `Arc`
//! - `Schema` is a request-local view: the shared base plus an optional
//!   *modified* copy, created on first change (copy-on-write)
//! - Indexing a document may add fields to the modified copy; the caller
//!   publishes it with a compare-and-swap and re-runs the whole transform if
//!   the publish loses a race
//!
//! Only top-level fields get types. Nested objects are stored but not
//! indexed.
//!
//! ## Terms
//!
//! | Kind | Term |
//! |------|------|
//! | document id | `Q` + type prefix + serialized id |
//! | boolean | `B<field>:t` / `B<field>:f` |
//! | integer | `N<field>:<n>` |
//! | float | `F<field>:<x>` |
//! | keyword | `K<field>:<value>` |
//! | text | `T<field>:<token>` with positions |
//! | array element | `A<field>:<element>` |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;
use vellum_core::{fields, TermId, VellumError, VellumResult};
use vellum_storage::{NativeDocument, SLOT_FIRST_FIELD, SLOT_ID};

/// Reserved fields never stored in the document object
const RESERVED: [&str; 4] = [fields::ID, fields::VERSION, fields::DATA, fields::OP_TYPE];

/// Type of a top-level field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// true / false
    Boolean,
    /// Signed or unsigned integer
    Integer,
    /// Any number
    Float,
    /// Exact-match string (or scalar rendered as one)
    Keyword,
    /// Whitespace-tokenized string
    Text,
    /// Nested map, stored but not indexed
    Object,
    /// List of scalars
    Array,
}

impl FieldType {
    /// Name used in schema definitions
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Keyword => "keyword",
            FieldType::Text => "text",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }

    /// Parse a type name (`string` is accepted for `text`)
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "boolean" => Some(FieldType::Boolean),
            "integer" => Some(FieldType::Integer),
            "float" => Some(FieldType::Float),
            "keyword" => Some(FieldType::Keyword),
            "text" | "string" => Some(FieldType::Text),
            "object" => Some(FieldType::Object),
            "array" => Some(FieldType::Array),
            _ => None,
        }
    }

    /// Term prefix character
    pub fn prefix(&self) -> char {
        match self {
            FieldType::Boolean => 'B',
            FieldType::Integer => 'N',
            FieldType::Float => 'F',
            FieldType::Keyword => 'K',
            FieldType::Text => 'T',
            FieldType::Object => 'O',
            FieldType::Array => 'A',
        }
    }

    fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::Text),
            Value::Array(_) => Some(FieldType::Array),
            Value::Object(_) => Some(FieldType::Object),
        }
    }

    /// Id type guessed from a value; strings become keywords
    fn infer_id(value: &Value) -> Option<Self> {
        match FieldType::infer(value)? {
            FieldType::Text => Some(FieldType::Keyword),
            FieldType::Array | FieldType::Object => None,
            other => Some(other),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Boolean => value.is_boolean(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Keyword => value.is_string() || value.is_number() || value.is_boolean(),
            FieldType::Text => value.is_string(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

/// Definition of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared or inferred type
    pub field_type: FieldType,
    /// Value slot holding the field's sortable value
    pub slot: u32,
}

/// Immutable, versioned schema definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Bumped by every successful publish
    pub version: u64,
    /// Type of document ids, fixed by the first document or by `write`
    pub id_type: Option<FieldType>,
    /// Top-level fields
    pub fields: BTreeMap<String, FieldSpec>,
}

impl SchemaSnapshot {
    /// True if both snapshots define the same id type and fields
    pub fn same_definition(&self, other: &SchemaSnapshot) -> bool {
        self.id_type == other.id_type && self.fields == other.fields
    }

    fn next_slot(&self) -> u32 {
        self.fields
            .values()
            .map(|f| f.slot + 1)
            .max()
            .unwrap_or(SLOT_FIRST_FIELD)
    }

    /// Definition as an object: `{ "<field>": { "_type": "<type>" } }`
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(id_type) = self.id_type {
            map.insert(fields::ID.to_string(), type_definition(id_type));
        }
        for (name, spec) in &self.fields {
            map.insert(name.clone(), type_definition(spec.field_type));
        }
        Value::Object(map)
    }
}

fn type_definition(field_type: FieldType) -> Value {
    let mut def = Map::new();
    def.insert(fields::TYPE.to_string(), Value::String(field_type.name().to_string()));
    Value::Object(def)
}

/// Output of indexing one object
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    /// Unique term of the document
    pub term_id: TermId,
    /// Resolved external id (generated if the object had none)
    pub document_id: Value,
    /// Backend document, without data or version
    pub doc: NativeDocument,
    /// Object to store and return: the input without reserved fields, plus `_id`
    pub obj: Value,
}

/// External id carried by `obj`, scalar or wrapped in `{ "_value": .. }`
pub fn document_id_of(obj: &Map<String, Value>) -> Option<Value> {
    let field = obj.get(fields::ID)?;
    let id = match field {
        Value::Object(map) => map.get(fields::VALUE)?.clone(),
        other => other.clone(),
    };
    (!id.is_null()).then_some(id)
}

/// Request-local schema: shared base plus a private modified copy
#[derive(Debug, Clone)]
pub struct Schema {
    base: Arc<SchemaSnapshot>,
    modified: Option<SchemaSnapshot>,
}

impl Schema {
    /// View over `base` with no modifications
    pub fn new(base: Arc<SchemaSnapshot>) -> Self {
        Schema {
            base,
            modified: None,
        }
    }

    /// Snapshot this view started from
    pub fn base(&self) -> &Arc<SchemaSnapshot> {
        &self.base
    }

    /// Current definition (modified copy if any)
    pub fn view(&self) -> &SchemaSnapshot {
        self.modified.as_ref().unwrap_or(&*self.base)
    }

    fn modify(&mut self) -> &mut SchemaSnapshot {
        let base = &self.base;
        self.modified.get_or_insert_with(|| SchemaSnapshot::clone(base))
    }

    /// True if the definition differs from the base
    pub fn is_modified(&self) -> bool {
        self.modified
            .as_ref()
            .map_or(false, |m| !m.same_definition(&self.base))
    }

    /// Take the modified copy, leaving the view unmodified
    pub fn take_modified(&mut self) -> Option<SchemaSnapshot> {
        self.modified.take()
    }

    /// Unique term for external id `id`
    ///
    /// Uses the schema's id type, or guesses one from the value.
    pub fn get_prefixed_term_id(&self, id: &Value) -> VellumResult<TermId> {
        let id_type = match self.view().id_type {
            Some(t) => t,
            None => FieldType::infer_id(id)
                .ok_or_else(|| VellumError::client(format!("Invalid id {}", id)))?,
        };
        prefixed_term_id(id_type, id)
    }

    /// Transform `obj` into a backend document
    ///
    /// New fields (and the id type of the first document) are recorded in
    /// the modified copy. An absent `document_id` gets a generated UUID.
    ///
    /// # Errors
    ///
    /// Client error on a type mismatch or an unusable id.
    pub fn index(
        &mut self,
        obj: &Map<String, Value>,
        document_id: Option<&Value>,
    ) -> VellumResult<IndexedDocument> {
        let (id_value, id_type) = match document_id.filter(|v| !v.is_null()) {
            Some(id) => {
                let current = self.view().id_type;
                let id_type = match current {
                    Some(t) if t.accepts(id) => t,
                    Some(t) => {
                        return Err(VellumError::client(format!(
                            "Id {} is not a valid {}",
                            id,
                            t.name()
                        )))
                    }
                    None => {
                        let t = FieldType::infer_id(id)
                            .ok_or_else(|| VellumError::client(format!("Invalid id {}", id)))?;
                        self.modify().id_type = Some(t);
                        t
                    }
                };
                (id.clone(), id_type)
            }
            None => {
                let current = self.view().id_type;
                match current {
                    Some(FieldType::Keyword) => {}
                    None => self.modify().id_type = Some(FieldType::Keyword),
                    Some(_) => return Err(VellumError::client("Document must have an 'id'")),
                }
                (Value::String(Uuid::new_v4().to_string()), FieldType::Keyword)
            }
        };

        let term_id = prefixed_term_id(id_type, &id_value)?;
        let mut doc = NativeDocument::new();
        doc.add_boolean_term(term_id.as_str());
        doc.add_value(SLOT_ID, serialise_scalar(&id_value).into_bytes());

        let mut stored = Map::new();
        for (name, value) in obj {
            if RESERVED.contains(&name.as_str()) {
                continue;
            }
            stored.insert(name.clone(), value.clone());
            if value.is_null() {
                continue;
            }
            let existing = self.view().fields.get(name).cloned();
            let spec = match existing {
                Some(spec) if spec.field_type.accepts(value) => spec,
                Some(spec) => {
                    return Err(VellumError::client(format!(
                        "Field {:?} expects {}, got {}",
                        name,
                        spec.field_type.name(),
                        value
                    )))
                }
                None => {
                    let field_type = FieldType::infer(value).ok_or_else(|| {
                        VellumError::internal(format!("Cannot infer type of {:?}", name))
                    })?;
                    let schema = self.modify();
                    let spec = FieldSpec {
                        field_type,
                        slot: schema.next_slot(),
                    };
                    schema.fields.insert(name.clone(), spec.clone());
                    spec
                }
            };
            index_field(&mut doc, name, &spec, value);
        }

        stored.insert(fields::ID.to_string(), id_value.clone());
        Ok(IndexedDocument {
            term_id,
            document_id: id_value,
            doc,
            obj: Value::Object(stored),
        })
    }

    /// Apply a schema definition object
    ///
    /// With `replace` the definition starts from scratch; otherwise it is
    /// merged and existing field types cannot change.
    pub fn write(&mut self, obj: &Value, replace: bool) -> VellumResult<()> {
        let map = obj
            .as_object()
            .ok_or_else(|| VellumError::client("Schema must be an object"))?;
        let mut next = if replace {
            SchemaSnapshot {
                version: self.base.version,
                ..SchemaSnapshot::default()
            }
        } else {
            self.view().clone()
        };

        for (name, def) in map {
            let type_name = match def {
                Value::String(s) => s.as_str(),
                Value::Object(m) => m.get(fields::TYPE).and_then(Value::as_str).ok_or_else(|| {
                    VellumError::client(format!("Field {:?} has no {:?}", name, fields::TYPE))
                })?,
                _ => {
                    return Err(VellumError::client(format!(
                        "Invalid definition for field {:?}",
                        name
                    )))
                }
            };
            let field_type = FieldType::parse(type_name)
                .ok_or_else(|| VellumError::client(format!("Unknown type {:?}", type_name)))?;

            if name == fields::ID {
                match next.id_type {
                    Some(existing) if existing != field_type => {
                        return Err(VellumError::client(format!(
                            "Id type is {}, cannot change to {}",
                            existing.name(),
                            field_type.name()
                        )))
                    }
                    _ => next.id_type = Some(field_type),
                }
                continue;
            }
            match next.fields.get(name) {
                Some(spec) if spec.field_type != field_type => {
                    return Err(VellumError::client(format!(
                        "Field {:?} is {}, cannot change to {}",
                        name,
                        spec.field_type.name(),
                        field_type.name()
                    )))
                }
                Some(_) => {}
                None => {
                    let slot = next.next_slot();
                    next.fields.insert(name.clone(), FieldSpec { field_type, slot });
                }
            }
        }
        self.modified = Some(next);
        Ok(())
    }
}

fn prefixed_term_id(id_type: FieldType, id: &Value) -> VellumResult<TermId> {
    if !id_type.accepts(id) {
        return Err(VellumError::client(format!(
            "Id {} is not a valid {}",
            id,
            id_type.name()
        )));
    }
    let prefix = match id_type {
        FieldType::Text => FieldType::Keyword.prefix(),
        other => other.prefix(),
    };
    Ok(TermId::new(format!("Q{}{}", prefix, serialise_scalar(id))))
}

fn serialise_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "t".to_string(),
        Value::Bool(false) => "f".to_string(),
        other => other.to_string(),
    }
}

/// Big-endian bytes whose lexical order matches numeric order
fn sortable_number(value: &Value) -> Vec<u8> {
    if let Some(i) = value.as_i64() {
        return ((i as u64) ^ (1 << 63)).to_be_bytes().to_vec();
    }
    let f = value.as_f64().unwrap_or_default();
    let bits = f.to_bits();
    let key = if f.is_sign_negative() {
        !bits
    } else {
        bits | (1 << 63)
    };
    key.to_be_bytes().to_vec()
}

fn index_field(doc: &mut NativeDocument, name: &str, spec: &FieldSpec, value: &Value) {
    let prefix = spec.field_type.prefix();
    match spec.field_type {
        FieldType::Boolean | FieldType::Keyword => {
            let s = serialise_scalar(value);
            doc.add_term(format!("{}{}:{}", prefix, name, s), 1);
            doc.add_value(spec.slot, s.into_bytes());
        }
        FieldType::Integer | FieldType::Float => {
            doc.add_term(format!("{}{}:{}", prefix, name, value), 1);
            doc.add_value(spec.slot, sortable_number(value));
        }
        FieldType::Text => {
            let text = value.as_str().unwrap_or_default();
            let tokens = text
                .split_whitespace()
                .map(|t| {
                    t.trim_matches(|c: char| !c.is_alphanumeric())
                        .to_lowercase()
                })
                .filter(|t| !t.is_empty());
            for (pos, token) in tokens.enumerate() {
                doc.add_posting(format!("{}{}:{}", prefix, name, token), pos as u32 + 1, 1);
            }
            doc.add_value(spec.slot, text.as_bytes().to_vec());
        }
        FieldType::Array => {
            if let Some(items) = value.as_array() {
                for item in items.iter().filter(|v| !v.is_object() && !v.is_array() && !v.is_null()) {
                    doc.add_term(format!("{}{}:{}", prefix, name, serialise_scalar(item)), 1);
                }
            }
        }
        FieldType::Object => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_first_document_records_fields() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        let input = obj(json!({"_id": "doc1", "title": "Hello World", "n": 3}));
        let id = document_id_of(&input);
        let indexed = schema.index(&input, id.as_ref()).unwrap();

        assert_eq!(indexed.term_id.as_str(), "QKdoc1");
        assert!(indexed.doc.has_term("QKdoc1"));
        assert!(indexed.doc.has_term("Ttitle:hello"));
        assert!(indexed.doc.has_term("Nn:3"));
        assert_eq!(indexed.obj, json!({"_id": "doc1", "title": "Hello World", "n": 3}));

        assert!(schema.is_modified());
        let modified = schema.take_modified().unwrap();
        assert_eq!(modified.id_type, Some(FieldType::Keyword));
        assert_eq!(modified.fields["title"].field_type, FieldType::Text);
        assert_eq!(modified.fields["n"].field_type, FieldType::Integer);
    }

    #[test]
    fn test_known_fields_do_not_modify() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        schema.index(&obj(json!({"a": 1})), Some(&json!("x"))).unwrap();
        let published = Arc::new(schema.take_modified().unwrap());

        let mut next = Schema::new(published);
        next.index(&obj(json!({"a": 2})), Some(&json!("y"))).unwrap();
        assert!(!next.is_modified());
    }

    #[test]
    fn test_type_mismatch_is_client_error() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        schema.index(&obj(json!({"a": 1})), Some(&json!("x"))).unwrap();
        let published = Arc::new(schema.take_modified().unwrap());

        let mut next = Schema::new(published);
        let err = next
            .index(&obj(json!({"a": "text"})), Some(&json!("y")))
            .unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn test_generated_id_is_uuid_keyword() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        let indexed = schema.index(&obj(json!({"a": true})), None).unwrap();
        let id = indexed.document_id.as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(indexed.term_id.as_str(), format!("QK{}", id));
    }

    #[test]
    fn test_integer_ids() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        let indexed = schema.index(&obj(json!({})), Some(&json!(42))).unwrap();
        assert_eq!(indexed.term_id.as_str(), "QN42");
        assert_eq!(schema.get_prefixed_term_id(&json!(42)).unwrap().as_str(), "QN42");
        assert!(schema.index(&obj(json!({})), Some(&json!("abc"))).is_err());
        assert!(schema.index(&obj(json!({})), None).is_err());
    }

    #[test]
    fn test_wrapped_document_id() {
        let input = obj(json!({"_id": {"_value": 7, "_type": "integer"}}));
        assert_eq!(document_id_of(&input), Some(json!(7)));
        assert_eq!(document_id_of(&obj(json!({"_id": null}))), None);
        assert_eq!(document_id_of(&obj(json!({"_id": {}}))), None);
    }

    #[test]
    fn test_write_merges_and_rejects_type_change() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        schema
            .write(&json!({"_id": {"_type": "keyword"}, "color": "keyword"}), false)
            .unwrap();
        assert_eq!(schema.view().fields["color"].field_type, FieldType::Keyword);
        assert!(schema.write(&json!({"color": "integer"}), false).is_err());
        schema.write(&json!({"size": "integer"}), true).unwrap();
        assert!(!schema.view().fields.contains_key("color"));
    }

    #[test]
    fn test_to_value_roundtrips_through_write() {
        let mut schema = Schema::new(Arc::new(SchemaSnapshot::default()));
        schema
            .index(&obj(json!({"a": 1.5, "b": ["x", "y"]})), Some(&json!("k")))
            .unwrap();
        let definition = schema.view().to_value();

        let mut other = Schema::new(Arc::new(SchemaSnapshot::default()));
        other.write(&definition, true).unwrap();
        assert_eq!(other.view().to_value(), definition);
    }

    #[test]
    fn test_sortable_numbers() {
        assert!(sortable_number(&json!(-5)) < sortable_number(&json!(3)));
        assert!(sortable_number(&json!(-2.5)) < sortable_number(&json!(-1.0)));
        assert!(sortable_number(&json!(0.5)) < sortable_number(&json!(10.25)));
    }
}
