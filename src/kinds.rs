//! Document Kinds - Static Processor Registration
//!
//! Every known document type is registered in a [`ProcessorTable`] at
//! startup. There is no runtime discovery of processors: an unregistered
//! type tag simply has no processor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::document::{
    TemplateDocument, FIELD_CATEGORY, FIELD_FAMILY, FIELD_FILENAME, FIELD_TYPE,
};
use crate::registry::{FieldType, TypeSchema};

/// Closed set of document types the builder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Prompt,
    Persona,
    Workflow,
    Policy,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Prompt,
        DocumentKind::Persona,
        DocumentKind::Workflow,
        DocumentKind::Policy,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "prompt" => Some(Self::Prompt),
            "persona" => Some(Self::Persona),
            "workflow" => Some(Self::Workflow),
            "policy" => Some(Self::Policy),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Persona => "persona",
            Self::Workflow => "workflow",
            Self::Policy => "policy",
        }
    }

    /// Bundle category the kind's documents are grouped under.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Prompt => "prompts",
            Self::Persona => "personas",
            Self::Workflow => "workflows",
            Self::Policy => "policies",
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt-library",
            Self::Persona => "persona-library",
            Self::Workflow => "workflow-library",
            Self::Policy => "policy-library",
        }
    }
}

/// Per-kind document preparation run during the ProcessDocuments stage.
pub trait KindProcessor {
    fn kind(&self) -> DocumentKind;

    /// Derive identity fields and fill autofill-eligible absent fields.
    /// Hash recomputation happens afterwards in the pipeline, not here.
    fn prepare(&self, document: &mut TemplateDocument, schema: &TypeSchema);
}

/// Default preparation shared by all registered kinds.
pub struct StandardKindProcessor {
    kind: DocumentKind,
}

impl StandardKindProcessor {
    pub fn new(kind: DocumentKind) -> Self {
        Self { kind }
    }
}

impl KindProcessor for StandardKindProcessor {
    fn kind(&self) -> DocumentKind {
        self.kind
    }

    fn prepare(&self, document: &mut TemplateDocument, schema: &TypeSchema) {
        // The source directory, not the authored field, decides the type.
        document.set_field(FIELD_TYPE, Value::String(self.kind.tag().to_string()));
        document.set_field(
            FIELD_CATEGORY,
            Value::String(self.kind.category().to_string()),
        );
        if !document.has_field(FIELD_FAMILY) {
            document.set_field(FIELD_FAMILY, Value::String(self.kind.family().to_string()));
        }
        if let Some(file_name) = document.file_name() {
            document.set_field(FIELD_FILENAME, Value::String(file_name));
        }

        for name in schema.autofill_fields() {
            if document.has_field(&name) {
                continue;
            }
            let value = schema
                .entry(&name)
                .map(autofill_value)
                .unwrap_or(Value::Null);
            document.set_field(&name, value);
        }
    }
}

fn autofill_value(entry: &crate::registry::FieldSchemaEntry) -> Value {
    if let Some(default) = &entry.default {
        return default.clone();
    }
    zero_value(&entry.field_type)
}

fn zero_value(field_type: &FieldType) -> Value {
    match field_type {
        FieldType::Str => Value::String(String::new()),
        FieldType::Int => Value::Number(0.into()),
        FieldType::Bool => Value::Bool(false),
        FieldType::Float => Value::Number(serde_yaml::Number::from(0.0)),
        FieldType::List(_) => Value::Sequence(Vec::new()),
        FieldType::Map => Value::Mapping(serde_yaml::Mapping::new()),
        FieldType::Any => Value::Null,
    }
}

/// All known kind processors, registered at startup.
pub struct ProcessorTable {
    processors: BTreeMap<DocumentKind, Box<dyn KindProcessor>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self {
            processors: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut table = Self::new();
        for kind in DocumentKind::ALL {
            table.register(Box::new(StandardKindProcessor::new(kind)));
        }
        table
    }

    pub fn register(&mut self, processor: Box<dyn KindProcessor>) {
        self.processors.insert(processor.kind(), processor);
    }

    pub fn get(&self, kind: DocumentKind) -> Option<&dyn KindProcessor> {
        self.processors.get(&kind).map(Box::as_ref)
    }
}

impl Default for ProcessorTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::path::PathBuf;

    const SCHEMA: &str = r#"
registry:
  id: tf-main
  name: Test Registry
  version: 1.0.0
types:
  prompt:
    fields:
      template_name: { type: string, required: true }
      tags: { type: "list[string]", autofill: true }
      attempts: { type: integer, autofill: true, default: 3 }
"#;

    #[test]
    fn tag_round_trip() {
        for kind in DocumentKind::ALL {
            assert_eq!(DocumentKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(DocumentKind::from_tag("sonnet"), None);
    }

    #[test]
    fn prepare_stamps_identity_and_autofills() {
        let registry = Registry::parse(SCHEMA, "inline").unwrap();
        let schema = registry.get("prompt").unwrap();

        let mut doc = TemplateDocument::parse("---\ntemplate_name: greeter\n---\nbody\n");
        doc.set_source(PathBuf::from("/src/prompt/greeter.md"));

        let table = ProcessorTable::standard();
        let processor = table.get(DocumentKind::Prompt).unwrap();
        processor.prepare(&mut doc, schema);

        assert_eq!(doc.get_str(FIELD_TYPE), Some("prompt"));
        assert_eq!(doc.get_str(FIELD_CATEGORY), Some("prompts"));
        assert_eq!(doc.get_str(FIELD_FAMILY), Some("prompt-library"));
        assert_eq!(doc.get_str(FIELD_FILENAME), Some("greeter.md"));
        assert_eq!(doc.get_field("tags"), Some(&Value::Sequence(Vec::new())));
        assert_eq!(doc.get_field("attempts"), Some(&Value::Number(3.into())));
    }

    #[test]
    fn autofill_never_overwrites_authored_values() {
        let registry = Registry::parse(SCHEMA, "inline").unwrap();
        let schema = registry.get("prompt").unwrap();

        let mut doc = TemplateDocument::parse("---\nattempts: 9\n---\nbody\n");
        let table = ProcessorTable::standard();
        table
            .get(DocumentKind::Prompt)
            .unwrap()
            .prepare(&mut doc, schema);
        assert_eq!(doc.get_field("attempts"), Some(&Value::Number(9.into())));
    }
}
