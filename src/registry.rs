//! Field Registry - Schema Catalog per Document Type
//!
//! One registry governs a document-type family. It is loaded once per run
//! from a declarative YAML source plus per-type profile files, and treated
//! as immutable by every downstream stage.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::verification::KNOWN_RULES;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed registry source {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid registry version '{raw}': {source}")]
    InvalidVersion {
        raw: String,
        #[source]
        source: semver::Error,
    },

    #[error("unknown value rule '{rule}' declared for field '{field}'")]
    UnknownRule { field: String, rule: String },

    #[error("profile {path} declares unknown document type '{tag}'")]
    UnknownProfileType { path: String, tag: String },
}

/// Closed field-type vocabulary.
///
/// Unknown type strings resolve to [`FieldType::Any`] so novel field types
/// degrade to "no constraint" instead of blocking a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Bool,
    Float,
    List(Option<Box<FieldType>>),
    Map,
    Any,
}

impl FieldType {
    pub fn resolve(raw: &str) -> Self {
        match raw.trim() {
            "string" => Self::Str,
            "integer" => Self::Int,
            "boolean" => Self::Bool,
            "float" => Self::Float,
            "map" => Self::Map,
            "list" => Self::List(None),
            other => {
                if let Some(inner) = other.strip_prefix("list[").and_then(|s| s.strip_suffix(']')) {
                    Self::List(Some(Box::new(Self::resolve(inner))))
                } else {
                    Self::Any
                }
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Str => "string".to_string(),
            Self::Int => "integer".to_string(),
            Self::Bool => "boolean".to_string(),
            Self::Float => "float".to_string(),
            Self::Map => "map".to_string(),
            Self::List(None) => "list".to_string(),
            Self::List(Some(inner)) => format!("list[{}]", inner.label()),
            Self::Any => "any".to_string(),
        }
    }

    /// Element-type constraint for list fields, if one was declared.
    pub fn list_subtype(&self) -> Option<&FieldType> {
        match self {
            Self::List(Some(inner)) => Some(inner),
            _ => None,
        }
    }
}

/// One field's declaration inside a type catalog.
#[derive(Debug, Clone)]
pub struct FieldSchemaEntry {
    pub name: String,
    pub raw_type: String,
    pub field_type: FieldType,
    pub required: bool,
    pub autofill: bool,
    pub deprecated: bool,
    pub nullable: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
    pub rule: Option<String>,
}

/// Per-type field-name sets loaded from the profile files.
///
/// `hidden` lists fields explicitly omitted for this target form; both the
/// verification and upgrade engines subtract it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeProfile {
    #[serde(default)]
    pub required: BTreeSet<String>,
    #[serde(default)]
    pub autofill: BTreeSet<String>,
    #[serde(default)]
    pub hidden: BTreeSet<String>,
    #[serde(default)]
    pub optional: BTreeSet<String>,
}

/// Resolved schema for one document type: field catalog + profile.
#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub tag: String,
    pub id: String,
    pub fields: BTreeMap<String, FieldSchemaEntry>,
    pub profile: TypeProfile,
}

impl TypeSchema {
    pub fn entry(&self, name: &str) -> Option<&FieldSchemaEntry> {
        self.fields.get(name)
    }

    /// Required field names: flag-required plus profile-required, minus hidden.
    pub fn required_fields(&self) -> BTreeSet<String> {
        let mut required: BTreeSet<String> = self
            .fields
            .values()
            .filter(|e| e.required)
            .map(|e| e.name.clone())
            .collect();
        required.extend(self.profile.required.iter().cloned());
        for hidden in &self.profile.hidden {
            required.remove(hidden);
        }
        required
    }

    /// Every declared field name, minus hidden.
    pub fn declared_fields(&self) -> BTreeSet<String> {
        let mut declared: BTreeSet<String> = self.fields.keys().cloned().collect();
        declared.extend(self.profile.optional.iter().cloned());
        for hidden in &self.profile.hidden {
            declared.remove(hidden);
        }
        declared
    }

    /// Autofill-eligible field names: flag-autofill plus profile-autofill.
    pub fn autofill_fields(&self) -> BTreeSet<String> {
        let mut autofill: BTreeSet<String> = self
            .fields
            .values()
            .filter(|e| e.autofill)
            .map(|e| e.name.clone())
            .collect();
        autofill.extend(self.profile.autofill.iter().cloned());
        autofill
    }

    /// Declared, non-deprecated field names (manifest audit set).
    pub fn non_deprecated_fields(&self) -> BTreeSet<String> {
        self.fields
            .values()
            .filter(|e| !e.deprecated)
            .map(|e| e.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub min_builder_version: Option<Version>,
    pub source_path: Option<PathBuf>,
    types: BTreeMap<String, TypeSchema>,
}

// --- declarative source shapes ---

#[derive(Debug, Deserialize)]
struct RegistrySource {
    registry: RegistryInfoSource,
    types: BTreeMap<String, TypeCatalogSource>,
}

#[derive(Debug, Deserialize)]
struct RegistryInfoSource {
    id: String,
    name: String,
    version: String,
    #[serde(default)]
    min_builder_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TypeCatalogSource {
    #[serde(default)]
    id: Option<String>,
    fields: BTreeMap<String, FieldSchemaSource>,
}

#[derive(Debug, Deserialize)]
struct FieldSchemaSource {
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    autofill: bool,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    allowed: Option<Vec<Value>>,
    #[serde(default)]
    rule: Option<String>,
}

impl Registry {
    /// Parse a registry from schema YAML text.
    pub fn parse(schema_yaml: &str, origin: &str) -> Result<Self, RegistryError> {
        let source: RegistrySource =
            serde_yaml::from_str(schema_yaml).map_err(|source| RegistryError::Malformed {
                path: origin.to_string(),
                source,
            })?;

        let version =
            Version::parse(&source.registry.version).map_err(|err| RegistryError::InvalidVersion {
                raw: source.registry.version.clone(),
                source: err,
            })?;
        let min_builder_version = match &source.registry.min_builder_version {
            Some(raw) => Some(Version::parse(raw).map_err(|err| RegistryError::InvalidVersion {
                raw: raw.clone(),
                source: err,
            })?),
            None => None,
        };

        let mut types = BTreeMap::new();
        for (tag, catalog) in source.types {
            let mut fields = BTreeMap::new();
            for (name, field) in catalog.fields {
                if let Some(rule) = &field.rule {
                    if !KNOWN_RULES.contains(&rule.as_str()) {
                        return Err(RegistryError::UnknownRule {
                            field: name,
                            rule: rule.clone(),
                        });
                    }
                }
                fields.insert(
                    name.clone(),
                    FieldSchemaEntry {
                        name,
                        field_type: FieldType::resolve(&field.field_type),
                        raw_type: field.field_type,
                        required: field.required,
                        autofill: field.autofill,
                        deprecated: field.deprecated,
                        nullable: field.nullable,
                        default: field.default,
                        allowed: field.allowed,
                        rule: field.rule,
                    },
                );
            }
            let id = catalog
                .id
                .unwrap_or_else(|| format!("{}-{}", source.registry.id, tag));
            types.insert(
                tag.clone(),
                TypeSchema {
                    tag,
                    id,
                    fields,
                    profile: TypeProfile::default(),
                },
            );
        }

        Ok(Self {
            id: source.registry.id,
            name: source.registry.name,
            version,
            min_builder_version,
            source_path: None,
            types,
        })
    }

    /// Load the schema file, then fold in every profile file found in
    /// `profiles_dir` (one `<tag>.yaml` per document type).
    pub fn load(schema_path: &Path, profiles_dir: &Path) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(schema_path).map_err(|source| RegistryError::Io {
            path: schema_path.display().to_string(),
            source,
        })?;
        let mut registry = Self::parse(&text, &schema_path.display().to_string())?;
        registry.source_path = Some(schema_path.to_path_buf());

        if profiles_dir.exists() {
            let entries = fs::read_dir(profiles_dir).map_err(|source| RegistryError::Io {
                path: profiles_dir.display().to_string(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| RegistryError::Io {
                    path: profiles_dir.display().to_string(),
                    source,
                })?;
                let path = entry.path();
                if path.extension().map_or(true, |e| e != "yaml" && e != "yml") {
                    continue;
                }
                let tag = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let text = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let profile: TypeProfile =
                    serde_yaml::from_str(&text).map_err(|source| RegistryError::Malformed {
                        path: path.display().to_string(),
                        source,
                    })?;
                registry.apply_profile(&tag, profile).map_err(|tag| {
                    RegistryError::UnknownProfileType {
                        path: path.display().to_string(),
                        tag,
                    }
                })?;
            }
        }

        Ok(registry)
    }

    /// Attach a profile to an already-declared type. Errs with the tag when
    /// the type is unknown.
    pub fn apply_profile(&mut self, tag: &str, profile: TypeProfile) -> Result<(), String> {
        match self.types.get_mut(tag) {
            Some(schema) => {
                schema.profile = profile;
                Ok(())
            }
            None => Err(tag.to_string()),
        }
    }

    pub fn get(&self, tag: &str) -> Option<&TypeSchema> {
        self.types.get(tag)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeSchema> {
        self.types.values()
    }

    pub fn type_tags(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    pub fn register(&mut self, schema: TypeSchema) {
        self.types.insert(schema.tag.clone(), schema);
    }

    /// Pin the version's patch component to the current build number.
    /// Registry version is build-scoped, not independently authored.
    pub fn set_build_number(&mut self, build_number: u64) {
        self.version.patch = build_number;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
registry:
  id: tf-main
  name: Test Registry
  version: 2.1.0
types:
  prompt:
    fields:
      template_name: { type: string, required: true }
      template_type: { type: string, required: true }
      temperature: { type: float, nullable: true }
      tags: { type: "list[string]", autofill: true, default: [] }
      audience: { type: string, allowed: [internal, public], rule: allowed_values }
      legacy_slug: { type: string, deprecated: true }
"#;

    #[test]
    fn resolve_closed_vocabulary() {
        assert_eq!(FieldType::resolve("string"), FieldType::Str);
        assert_eq!(FieldType::resolve("integer"), FieldType::Int);
        assert_eq!(FieldType::resolve("boolean"), FieldType::Bool);
        assert_eq!(FieldType::resolve("float"), FieldType::Float);
        assert_eq!(FieldType::resolve("map"), FieldType::Map);
        assert_eq!(FieldType::resolve("list"), FieldType::List(None));
        assert_eq!(
            FieldType::resolve("list[integer]"),
            FieldType::List(Some(Box::new(FieldType::Int)))
        );
    }

    #[test]
    fn unknown_type_degrades_to_any() {
        assert_eq!(FieldType::resolve("tensor"), FieldType::Any);
        assert_eq!(
            FieldType::resolve("list[tensor]"),
            FieldType::List(Some(Box::new(FieldType::Any)))
        );
    }

    #[test]
    fn parse_and_query_schema() {
        let registry = Registry::parse(SCHEMA, "inline").unwrap();
        assert_eq!(registry.id, "tf-main");
        assert_eq!(registry.version, Version::new(2, 1, 0));

        let prompt = registry.get("prompt").unwrap();
        assert_eq!(prompt.id, "tf-main-prompt");
        let required = prompt.required_fields();
        assert!(required.contains("template_name"));
        assert!(!required.contains("temperature"));
        assert!(prompt.autofill_fields().contains("tags"));
        assert!(!prompt.non_deprecated_fields().contains("legacy_slug"));
        assert!(prompt.declared_fields().contains("legacy_slug"));
    }

    #[test]
    fn profile_hidden_subtracts_from_required_and_declared() {
        let mut registry = Registry::parse(SCHEMA, "inline").unwrap();
        let profile = TypeProfile {
            required: ["audience".to_string()].into(),
            hidden: ["template_name".to_string()].into(),
            ..TypeProfile::default()
        };
        registry.apply_profile("prompt", profile).unwrap();

        let prompt = registry.get("prompt").unwrap();
        let required = prompt.required_fields();
        assert!(required.contains("audience"));
        assert!(!required.contains("template_name"));
        assert!(!prompt.declared_fields().contains("template_name"));
    }

    #[test]
    fn profile_for_unknown_type_is_rejected() {
        let mut registry = Registry::parse(SCHEMA, "inline").unwrap();
        let err = registry.apply_profile("sonnet", TypeProfile::default());
        assert_eq!(err, Err("sonnet".to_string()));
    }

    #[test]
    fn unknown_rule_name_is_a_fault() {
        let schema = r#"
registry: { id: tf, name: T, version: 1.0.0 }
types:
  prompt:
    fields:
      audience: { type: string, rule: no_such_rule }
"#;
        let err = Registry::parse(schema, "inline").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRule { .. }));
    }

    #[test]
    fn build_number_pins_patch() {
        let mut registry = Registry::parse(SCHEMA, "inline").unwrap();
        registry.set_build_number(17);
        assert_eq!(registry.version.to_string(), "2.1.17");
    }
}
