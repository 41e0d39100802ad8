//! Field tagging and document decoding.
//!
//! A schema tags every field of an entity type as shared, local-only or
//! linkage. Remote documents are flat JSON objects; the schema splits them
//! into the partitions of [`Entity`] and joins them back for upload.

use crate::{
    entity::{FieldMap, FAVORITE_FIELD},
    error::Result,
    Entity, Error, Linkage,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved document key for the entity id.
pub const ID_KEY: &str = "id";
/// Reserved document key for the owner id.
pub const OWNER_KEY: &str = "ownerId";
/// Reserved document key for the merge clock.
pub const UPDATED_AT_KEY: &str = "updatedAt";

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Array,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Array => write!(f, "Array"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Which linkage slot a linkage field maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkageSlot {
    RemoteHandle,
    AssetHandle,
    AssetModifiedAt,
}

/// How the merge treats a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldClass {
    /// Supplied atomically by whichever side wins the merge
    Shared,
    /// Always preserved from the local copy, never uploaded
    LocalOnly,
    /// Taken from whichever side holds a value
    Linkage(LinkageSlot),
}

/// Definition of a field in an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name (document key)
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Merge class
    pub class: FieldClass,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a required shared field.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            class: FieldClass::Shared,
            required: true,
        }
    }

    /// Create an optional shared field.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            class: FieldClass::Shared,
            required: false,
        }
    }

    /// Create a local-only field.
    pub fn local_only(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            class: FieldClass::LocalOnly,
            required: false,
        }
    }

    /// Create a linkage field bound to `slot`.
    pub fn linkage(name: impl Into<String>, slot: LinkageSlot) -> Self {
        let field_type = match slot {
            LinkageSlot::AssetModifiedAt => FieldType::Timestamp,
            LinkageSlot::RemoteHandle | LinkageSlot::AssetHandle => FieldType::String,
        };
        Self {
            name: name.into(),
            field_type,
            class: FieldClass::Linkage(slot),
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Array => value.is_array(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Entity type name, e.g. "recipe"
    pub entity_type: String,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    /// Create a new entity schema.
    pub fn new(entity_type: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields,
        }
    }

    /// The recipe schema.
    pub fn recipe() -> Self {
        Self::new(
            "recipe",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("summary", FieldType::String),
                FieldDef::optional("ingredients", FieldType::Array),
                FieldDef::optional("steps", FieldType::Array),
                FieldDef::optional("tags", FieldType::Array),
                FieldDef::optional("servings", FieldType::Int),
                FieldDef::optional("prepMinutes", FieldType::Int),
                FieldDef::optional("cookMinutes", FieldType::Int),
                FieldDef::optional("sourceUrl", FieldType::String),
                FieldDef::optional("notes", FieldType::String),
                FieldDef::local_only(FAVORITE_FIELD, FieldType::Bool),
                FieldDef::local_only("imagePath", FieldType::String),
                FieldDef::linkage("cloudRecordName", LinkageSlot::RemoteHandle),
                FieldDef::linkage("cloudAssetName", LinkageSlot::AssetHandle),
                FieldDef::linkage("assetModifiedAt", LinkageSlot::AssetModifiedAt),
            ],
        )
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Merge class of a field. Undeclared fields are shared.
    pub fn class_of(&self, name: &str) -> FieldClass {
        self.field(name).map(|f| f.class).unwrap_or(FieldClass::Shared)
    }

    /// Reconstruct an entity from a flat document.
    ///
    /// Local-only keys found in the document are kept in `local`, so the same
    /// routine serves local imports. Remote copies never carry them because
    /// [`EntitySchema::encode_remote`] drops them.
    pub fn decode(&self, document: &Value) -> Result<Entity> {
        let obj = document
            .as_object()
            .ok_or_else(|| Error::InvalidDocument("document must be an object".into()))?;

        let id = obj
            .get(ID_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MissingRequiredField(ID_KEY.into()))?
            .to_string();

        let updated_at = obj
            .get(UPDATED_AT_KEY)
            .ok_or_else(|| Error::MissingRequiredField(UPDATED_AT_KEY.into()))?
            .as_u64()
            .ok_or_else(|| Error::TypeMismatch {
                field: UPDATED_AT_KEY.into(),
                expected: FieldType::Timestamp.to_string(),
                got: json_type_name(&obj[UPDATED_AT_KEY]).to_string(),
            })?;

        let owner_id = match obj.get(OWNER_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(Error::TypeMismatch {
                    field: OWNER_KEY.into(),
                    expected: FieldType::String.to_string(),
                    got: json_type_name(other).to_string(),
                })
            }
        };

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        let mut shared = FieldMap::new();
        let mut local = FieldMap::new();
        let mut linkage = Linkage::default();

        for (key, value) in obj {
            if matches!(key.as_str(), ID_KEY | OWNER_KEY | UPDATED_AT_KEY) || value.is_null() {
                continue;
            }
            match self.class_of(key) {
                FieldClass::Shared => {
                    shared.insert(key.clone(), value.clone());
                }
                FieldClass::LocalOnly => {
                    local.insert(key.clone(), value.clone());
                }
                FieldClass::Linkage(LinkageSlot::RemoteHandle) => {
                    linkage.remote_handle = value.as_str().map(str::to_string);
                }
                FieldClass::Linkage(LinkageSlot::AssetHandle) => {
                    linkage.asset_handle = value.as_str().map(str::to_string);
                }
                FieldClass::Linkage(LinkageSlot::AssetModifiedAt) => {
                    linkage.asset_modified_at = value.as_u64();
                }
            }
        }

        Ok(Entity {
            id,
            owner_id,
            updated_at,
            shared,
            local,
            linkage,
        })
    }

    /// Flatten an entity into a document for the remote store.
    ///
    /// Local-only fields are never emitted.
    pub fn encode_remote(&self, entity: &Entity) -> Value {
        let mut obj = Map::new();
        obj.insert(ID_KEY.into(), Value::String(entity.id.clone()));
        obj.insert(UPDATED_AT_KEY.into(), Value::from(entity.updated_at));
        if let Some(owner) = &entity.owner_id {
            obj.insert(OWNER_KEY.into(), Value::String(owner.clone()));
        }

        for (key, value) in &entity.shared {
            if self.class_of(key) == FieldClass::Shared {
                obj.insert(key.clone(), value.clone());
            }
        }

        for field in &self.fields {
            let value = match field.class {
                FieldClass::Linkage(LinkageSlot::RemoteHandle) => {
                    entity.linkage.remote_handle.clone().map(Value::String)
                }
                FieldClass::Linkage(LinkageSlot::AssetHandle) => {
                    entity.linkage.asset_handle.clone().map(Value::String)
                }
                FieldClass::Linkage(LinkageSlot::AssetModifiedAt) => {
                    entity.linkage.asset_modified_at.map(Value::from)
                }
                FieldClass::Shared | FieldClass::LocalOnly => None,
            };
            if let Some(value) = value {
                obj.insert(field.name.clone(), value);
            }
        }

        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote_doc() -> Value {
        json!({
            "id": "r1",
            "ownerId": "alice",
            "updatedAt": 2000,
            "title": "Shakshuka",
            "ingredients": ["eggs", "tomatoes"],
            "servings": 2,
            "cloudRecordName": "rec-r1",
            "cloudAssetName": "asset-r1",
            "assetModifiedAt": 1500
        })
    }

    #[test]
    fn decode_partitions_fields() {
        let entity = EntitySchema::recipe().decode(&remote_doc()).unwrap();

        assert_eq!(entity.id, "r1");
        assert_eq!(entity.owner_id.as_deref(), Some("alice"));
        assert_eq!(entity.updated_at, 2000);
        assert_eq!(entity.shared["title"], "Shakshuka");
        assert_eq!(entity.shared["servings"], 2);
        assert!(entity.local.is_empty());
        assert_eq!(entity.linkage.remote_handle.as_deref(), Some("rec-r1"));
        assert_eq!(entity.linkage.asset_handle.as_deref(), Some("asset-r1"));
        assert_eq!(entity.linkage.asset_modified_at, Some(1500));
    }

    #[test]
    fn undeclared_fields_are_shared() {
        let mut doc = remote_doc();
        doc["cuisine"] = json!("north african");
        let entity = EntitySchema::recipe().decode(&doc).unwrap();
        assert_eq!(entity.shared["cuisine"], "north african");
    }

    #[test]
    fn decode_rejects_missing_title() {
        let mut doc = remote_doc();
        doc.as_object_mut().unwrap().remove("title");
        let err = EntitySchema::recipe().decode(&doc).unwrap_err();
        assert_eq!(err, Error::MissingRequiredField("title".into()));
    }

    #[test]
    fn decode_rejects_type_mismatch() {
        let mut doc = remote_doc();
        doc["servings"] = json!("two");
        let err = EntitySchema::recipe().decode(&doc).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { ref field, .. } if field == "servings"));
        assert!(err.is_decode_failure());
    }

    #[test]
    fn decode_rejects_non_object_and_bad_clock() {
        let schema = EntitySchema::recipe();
        assert!(matches!(
            schema.decode(&json!([1, 2])),
            Err(Error::InvalidDocument(_))
        ));

        let mut doc = remote_doc();
        doc["updatedAt"] = json!("yesterday");
        assert!(schema.decode(&doc).unwrap_err().is_decode_failure());
    }

    #[test]
    fn encode_remote_drops_local_only_fields() {
        let schema = EntitySchema::recipe();
        let entity = schema
            .decode(&remote_doc())
            .unwrap()
            .with_local(FAVORITE_FIELD, json!(true))
            .with_local("imagePath", json!("/tmp/r1.jpg"));

        let doc = schema.encode_remote(&entity);
        assert!(doc.get(FAVORITE_FIELD).is_none());
        assert!(doc.get("imagePath").is_none());
        assert_eq!(doc["cloudRecordName"], "rec-r1");
        assert_eq!(doc["title"], "Shakshuka");

        let decoded = schema.decode(&doc).unwrap();
        assert_eq!(decoded.shared, entity.shared);
        assert_eq!(decoded.linkage, entity.linkage);
    }

    #[test]
    fn class_lookup() {
        let schema = EntitySchema::recipe();
        assert_eq!(schema.class_of("title"), FieldClass::Shared);
        assert_eq!(schema.class_of(FAVORITE_FIELD), FieldClass::LocalOnly);
        assert_eq!(
            schema.class_of("cloudRecordName"),
            FieldClass::Linkage(LinkageSlot::RemoteHandle)
        );
        assert_eq!(schema.class_of("unknown"), FieldClass::Shared);
    }
}
