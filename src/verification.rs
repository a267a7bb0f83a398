//! Verification Engine - Schema Conformance as Data
//!
//! Validation failures are never raised. The engine compares one document
//! against its registry entry and produces a structured report; callers
//! decide what a non-empty report means. Only pipeline-internal faults
//! (no usable type field, no registry entry) surface as errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::document::TemplateDocument;
use crate::registry::{FieldSchemaEntry, FieldType, Registry, TypeSchema};

/// Named rules the registry source may reference.
pub const KNOWN_RULES: &[&str] = &["allowed_values", "numeric_string_list"];

#[derive(Debug, Error)]
pub enum VerificationFault {
    #[error("document has no 'template_type' field; cannot resolve a registry entry")]
    MissingTypeField,

    #[error("registry has no entry for document type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub template_type: String,
    pub missing_fields: Vec<String>,
    pub extra_fields: Vec<String>,
    pub incorrect_type_fields: BTreeMap<String, TypeMismatch>,
    pub rule_errors: BTreeMap<String, String>,
    pub rule_warnings: BTreeMap<String, String>,
}

impl VerificationReport {
    /// A pass requires empty missing/extra/incorrect-type sets and no rule
    /// errors. Rule warnings never fail a document.
    pub fn is_pass(&self) -> bool {
        self.missing_fields.is_empty()
            && self.extra_fields.is_empty()
            && self.incorrect_type_fields.is_empty()
            && self.rule_errors.is_empty()
    }

    /// The `verify` action exits non-zero only on missing or mistyped fields.
    pub fn blocks_verify(&self) -> bool {
        !self.missing_fields.is_empty() || !self.incorrect_type_fields.is_empty()
    }

    /// Structured-text rendering for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "verification report (type: {})", self.template_type);
        let _ = writeln!(out, "  missing fields:   {:?}", self.missing_fields);
        let _ = writeln!(out, "  extra fields:     {:?}", self.extra_fields);
        if self.incorrect_type_fields.is_empty() {
            let _ = writeln!(out, "  incorrect types:  []");
        } else {
            let _ = writeln!(out, "  incorrect types:");
            for (field, mismatch) in &self.incorrect_type_fields {
                let _ = writeln!(
                    out,
                    "    {}: expected {}, found {}",
                    field, mismatch.expected, mismatch.actual
                );
            }
        }
        for (label, map) in [
            ("rule errors", &self.rule_errors),
            ("rule warnings", &self.rule_warnings),
        ] {
            if map.is_empty() {
                let _ = writeln!(out, "  {}:      []", label);
            } else {
                let _ = writeln!(out, "  {}:", label);
                for (field, message) in map {
                    let _ = writeln!(out, "    {}: {}", field, message);
                }
            }
        }
        let _ = writeln!(out, "  result: {}", if self.is_pass() { "PASS" } else { "FAIL" });
        out
    }
}

/// Outcome of evaluating one field rule.
pub enum RuleOutcome {
    Pass,
    Fail { message: String },
}

/// A named rule bound to one field.
///
/// Rules only report failures; the engine decides severity. A failure on a
/// field that is structurally present with a schema entry is an error;
/// a failure because the field (or its entry) is absent downgrades to a
/// warning, since optional fields legitimately may be unset.
pub trait FieldRule {
    fn name(&self) -> &'static str;
    fn field(&self) -> &str;
    fn evaluate(&self, document: &TemplateDocument, schema: &TypeSchema) -> RuleOutcome;
}

/// Scalar value must be one of the enumerated allowed set.
pub struct AllowedValuesRule {
    field: String,
    allowed: Vec<Value>,
}

impl FieldRule for AllowedValuesRule {
    fn name(&self) -> &'static str {
        "allowed_values"
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn evaluate(&self, document: &TemplateDocument, _schema: &TypeSchema) -> RuleOutcome {
        let Some(value) = document.get_field(&self.field) else {
            return RuleOutcome::Fail {
                message: format!("field '{}' is not set", self.field),
            };
        };
        if self.allowed.contains(value) {
            RuleOutcome::Pass
        } else {
            RuleOutcome::Fail {
                message: format!(
                    "value {} is not one of the allowed set {}",
                    render_value(value),
                    render_values(&self.allowed)
                ),
            }
        }
    }
}

/// Value must be a list of purely numeric-looking strings.
pub struct NumericStringListRule {
    field: String,
}

impl NumericStringListRule {
    fn is_numeric_string(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
    }
}

impl FieldRule for NumericStringListRule {
    fn name(&self) -> &'static str {
        "numeric_string_list"
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn evaluate(&self, document: &TemplateDocument, _schema: &TypeSchema) -> RuleOutcome {
        let Some(value) = document.get_field(&self.field) else {
            return RuleOutcome::Fail {
                message: format!("field '{}' is not set", self.field),
            };
        };
        let Some(items) = value.as_sequence() else {
            return RuleOutcome::Fail {
                message: format!("field '{}' is not a list", self.field),
            };
        };
        for item in items {
            match item.as_str() {
                Some(s) if Self::is_numeric_string(s) => {}
                Some(s) => {
                    return RuleOutcome::Fail {
                        message: format!("element '{}' is not a numeric string", s),
                    }
                }
                None => {
                    return RuleOutcome::Fail {
                        message: format!(
                            "element {} is not a string",
                            render_value(item)
                        ),
                    }
                }
            }
        }
        RuleOutcome::Pass
    }
}

/// Static registration table mapping rule names to constructors.
fn build_rule(name: &str, entry: &FieldSchemaEntry) -> Option<Box<dyn FieldRule>> {
    match name {
        "allowed_values" => Some(Box::new(AllowedValuesRule {
            field: entry.name.clone(),
            allowed: entry.allowed.clone().unwrap_or_default(),
        })),
        "numeric_string_list" => Some(Box::new(NumericStringListRule {
            field: entry.name.clone(),
        })),
        _ => None,
    }
}

/// Build the rule set for one type schema: every entry carrying an
/// allowed-value enumeration gets `allowed_values`, plus any rule the
/// schema names explicitly.
fn standard_rules(schema: &TypeSchema) -> Vec<Box<dyn FieldRule>> {
    let mut rules: Vec<Box<dyn FieldRule>> = Vec::new();
    for entry in schema.fields.values() {
        let explicit = entry.rule.as_deref();
        if entry.allowed.is_some() && explicit != Some("allowed_values") {
            if let Some(rule) = build_rule("allowed_values", entry) {
                rules.push(rule);
            }
        }
        if let Some(name) = explicit {
            if let Some(rule) = build_rule(name, entry) {
                rules.push(rule);
            }
        }
    }
    rules
}

pub struct Verifier<'r> {
    registry: &'r Registry,
}

impl<'r> Verifier<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    pub fn verify(
        &self,
        document: &TemplateDocument,
    ) -> Result<VerificationReport, VerificationFault> {
        let tag = document
            .template_type()
            .ok_or(VerificationFault::MissingTypeField)?;
        let schema = self
            .registry
            .get(tag)
            .ok_or_else(|| VerificationFault::UnknownType(tag.to_string()))?;

        let doc_fields: BTreeSet<String> = document.keys().into_iter().collect();
        let required = schema.required_fields();
        let declared = schema.declared_fields();

        let missing_fields: Vec<String> = required.difference(&doc_fields).cloned().collect();
        let extra_fields: Vec<String> = doc_fields.difference(&declared).cloned().collect();

        let mut incorrect_type_fields = BTreeMap::new();
        for name in &doc_fields {
            let Some(entry) = schema.entry(name) else {
                continue;
            };
            let Some(value) = document.get_field(name) else {
                continue;
            };
            if let Some(mismatch) = check_type(entry, value) {
                incorrect_type_fields.insert(name.clone(), mismatch);
            }
        }

        let mut rule_errors = BTreeMap::new();
        let mut rule_warnings = BTreeMap::new();
        for rule in standard_rules(schema) {
            if let RuleOutcome::Fail { message } = rule.evaluate(document, schema) {
                let field = rule.field().to_string();
                let structurally_present =
                    document.has_field(&field) && schema.entry(&field).is_some();
                if structurally_present {
                    rule_errors.insert(field, message);
                } else {
                    rule_warnings.insert(field, message);
                }
            }
        }

        Ok(VerificationReport {
            template_type: tag.to_string(),
            missing_fields,
            extra_fields,
            incorrect_type_fields,
            rule_errors,
            rule_warnings,
        })
    }
}

/// Fields present in a canonical instance but absent from the document.
/// Backs the `verify --against-canonical` diff.
pub fn diff_missing_fields(
    document: &TemplateDocument,
    canonical: &TemplateDocument,
) -> Vec<String> {
    let doc_fields: BTreeSet<String> = document.keys().into_iter().collect();
    canonical
        .keys()
        .into_iter()
        .filter(|k| !doc_fields.contains(k))
        .collect()
}

fn check_type(entry: &FieldSchemaEntry, value: &Value) -> Option<TypeMismatch> {
    if value.is_null() {
        if entry.nullable || entry.field_type == FieldType::Any {
            return None;
        }
        return Some(TypeMismatch {
            expected: entry.field_type.label(),
            actual: "null".to_string(),
        });
    }

    if !shallow_matches(&entry.field_type, value) {
        return Some(TypeMismatch {
            expected: entry.field_type.label(),
            actual: runtime_label(value).to_string(),
        });
    }

    // Element pass for constrained lists.
    if let (Some(subtype), Some(items)) = (entry.field_type.list_subtype(), value.as_sequence()) {
        for item in items {
            if !shallow_matches(subtype, item) {
                return Some(TypeMismatch {
                    expected: entry.field_type.label(),
                    actual: format!("list containing {}", runtime_label(item)),
                });
            }
        }
    }

    None
}

fn shallow_matches(field_type: &FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Any => true,
        FieldType::Str => value.is_string(),
        FieldType::Bool => value.is_bool(),
        FieldType::Int => matches!(value, Value::Number(n) if n.is_i64() || n.is_u64()),
        // Integers widen to float; nothing else coerces.
        FieldType::Float => value.is_number(),
        FieldType::Map => value.is_mapping(),
        FieldType::List(_) => value.is_sequence(),
    }
}

fn runtime_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "map",
        Value::Tagged(_) => "tagged",
    }
}

fn render_value(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "<unrenderable>".to_string())
}

fn render_values(values: &[Value]) -> String {
    let rendered: Vec<String> = values.iter().map(render_value).collect();
    format!("[{}]", rendered.join(", "))
}
