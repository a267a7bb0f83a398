//! Document Model - Frontmatter + Body
//!
//! A template document is a fenced YAML metadata block followed by a
//! Markdown body. Parsing is deliberately lenient: hand-authored documents
//! with a missing or broken metadata block still load, they just carry an
//! empty metadata map.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::hashing::compute_template_hash;

/// Delimiter line opening and closing the metadata block.
pub const FENCE: &str = "---";

pub const FIELD_TYPE: &str = "template_type";
pub const FIELD_VERSION: &str = "template_version";
pub const FIELD_HASH: &str = "template_hash";
pub const FIELD_NAME: &str = "template_name";
pub const FIELD_ID: &str = "template_id";
pub const FIELD_CATEGORY: &str = "template_category";
pub const FIELD_FAMILY: &str = "template_family";
pub const FIELD_FILENAME: &str = "template_filename";
pub const FIELD_REGISTRY: &str = "template_registry";

/// How the metadata block of a parsed document was obtained.
///
/// `NoMetadata` and `MalformedFrontmatter` are documented fallbacks, not
/// error paths: loose input degrades to an empty metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Well-fenced block with valid YAML mapping.
    Parsed,
    /// No opening fence, or an opening fence that was never closed.
    /// The entire input is treated as body.
    NoMetadata,
    /// Well-fenced block whose contents did not parse as a YAML mapping.
    /// The body after the closing fence is kept.
    MalformedFrontmatter,
}

#[derive(Debug, Clone)]
pub struct TemplateDocument {
    metadata: Mapping,
    body: String,
    source: Option<PathBuf>,
    outcome: ParseOutcome,
}

impl TemplateDocument {
    /// Construct programmatically from a metadata map and body.
    pub fn new(metadata: Mapping, body: impl Into<String>) -> Self {
        Self {
            metadata,
            body: body.into(),
            source: None,
            outcome: ParseOutcome::Parsed,
        }
    }

    /// Parse a document from raw text. Never fails; see [`ParseOutcome`].
    pub fn parse(text: &str) -> Self {
        let Some(after_open) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n"))
        else {
            return Self {
                metadata: Mapping::new(),
                body: text.to_string(),
                source: None,
                outcome: ParseOutcome::NoMetadata,
            };
        };

        let mut offset = 0usize;
        for line in after_open.split_inclusive('\n') {
            let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
            if trimmed == FENCE {
                let yaml_src = &after_open[..offset];
                let body = after_open[offset + line.len()..].to_string();
                return match serde_yaml::from_str::<Value>(yaml_src) {
                    Ok(Value::Mapping(metadata)) => Self {
                        metadata,
                        body,
                        source: None,
                        outcome: ParseOutcome::Parsed,
                    },
                    Ok(Value::Null) => Self {
                        metadata: Mapping::new(),
                        body,
                        source: None,
                        outcome: ParseOutcome::Parsed,
                    },
                    _ => Self {
                        metadata: Mapping::new(),
                        body,
                        source: None,
                        outcome: ParseOutcome::MalformedFrontmatter,
                    },
                };
            }
            offset += line.len();
        }

        // Opening fence without a closing fence: fall back to body-only.
        Self {
            metadata: Mapping::new(),
            body: text.to_string(),
            source: None,
            outcome: ParseOutcome::NoMetadata,
        }
    }

    /// Read and parse a document file, remembering its source path.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut doc = Self::parse(&text);
        doc.source = Some(path.to_path_buf());
        Ok(doc)
    }

    pub fn outcome(&self) -> ParseOutcome {
        self.outcome
    }

    pub fn metadata(&self) -> &Mapping {
        &self.metadata
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, path: PathBuf) {
        self.source = Some(path);
    }

    /// File name of the source artifact, if the document came from disk.
    pub fn file_name(&self) -> Option<String> {
        self.source
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.metadata.contains_key(Value::String(name.to_string()))
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.metadata.get(Value::String(name.to_string()))
    }

    /// Field value, or the supplied default when absent.
    pub fn get_field_or<'a>(&'a self, name: &str, default: &'a Value) -> &'a Value {
        self.get_field(name).unwrap_or(default)
    }

    /// String view of a field, when the field exists and is a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get_field(name).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.metadata.insert(Value::String(name.to_string()), value);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.metadata.remove(Value::String(name.to_string()))
    }

    /// All metadata keys in stable sorted order. Non-string keys (legal YAML,
    /// never produced by the pipeline) are skipped.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .metadata
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
        keys.sort();
        keys
    }

    pub fn template_type(&self) -> Option<&str> {
        self.get_str(FIELD_TYPE)
    }

    pub fn template_version(&self) -> Option<&str> {
        self.get_str(FIELD_VERSION)
    }

    pub fn stored_hash(&self) -> Option<&str> {
        self.get_str(FIELD_HASH)
    }

    /// Recompute the canonical hash and write it into the hash field.
    ///
    /// Mutations do not refresh the hash implicitly; pipeline stages fill
    /// fields incrementally and call this once the document is final.
    pub fn refresh_hash(&mut self) -> Result<String, serde_json::Error> {
        let digest = compute_template_hash(&self.metadata, &self.body)?;
        self.set_field(FIELD_HASH, Value::String(digest.clone()));
        Ok(digest)
    }

    /// Serialize back to fenced-frontmatter Markdown text.
    pub fn to_markdown(&self) -> Result<String, serde_yaml::Error> {
        if self.metadata.is_empty() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.metadata)?;
        Ok(format!("{}\n{}{}\n{}", FENCE, yaml, FENCE, self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "---\ntemplate_name: greeter\ntemplate_type: prompt\ntags:\n- intro\n- short\n---\n# Greeter\n\nHello.\n";

    #[test]
    fn parse_well_fenced_document() {
        let doc = TemplateDocument::parse(SAMPLE);
        assert_eq!(doc.outcome(), ParseOutcome::Parsed);
        assert_eq!(doc.get_str("template_name"), Some("greeter"));
        assert_eq!(doc.body(), "# Greeter\n\nHello.\n");
    }

    #[test]
    fn parse_without_fence_is_all_body() {
        let doc = TemplateDocument::parse("just a body\nwith lines\n");
        assert_eq!(doc.outcome(), ParseOutcome::NoMetadata);
        assert!(doc.metadata().is_empty());
        assert_eq!(doc.body(), "just a body\nwith lines\n");
    }

    #[test]
    fn parse_unclosed_fence_falls_back_to_body() {
        let text = "---\ntemplate_name: greeter\nno closing fence here\n";
        let doc = TemplateDocument::parse(text);
        assert_eq!(doc.outcome(), ParseOutcome::NoMetadata);
        assert!(doc.metadata().is_empty());
        assert_eq!(doc.body(), text);
    }

    #[test]
    fn parse_malformed_frontmatter_keeps_body() {
        let text = "---\n: [ not yaml ::\n---\nbody survives\n";
        let doc = TemplateDocument::parse(text);
        assert_eq!(doc.outcome(), ParseOutcome::MalformedFrontmatter);
        assert!(doc.metadata().is_empty());
        assert_eq!(doc.body(), "body survives\n");
    }

    #[test]
    fn round_trip_preserves_metadata_and_body() {
        let doc = TemplateDocument::parse(SAMPLE);
        let text = doc.to_markdown().unwrap();
        let again = TemplateDocument::parse(&text);
        assert_eq!(again.outcome(), ParseOutcome::Parsed);
        assert_eq!(again.metadata(), doc.metadata());
        assert_eq!(again.body(), doc.body());
    }

    #[test]
    fn field_accessors_and_sorted_keys() {
        let mut doc = TemplateDocument::parse(SAMPLE);
        assert!(doc.has_field("tags"));
        doc.set_field("zeta", Value::Bool(true));
        doc.set_field("alpha", Value::Number(1.into()));
        assert_eq!(
            doc.keys(),
            vec!["alpha", "tags", "template_name", "template_type", "zeta"]
        );
        assert!(doc.remove_field("tags").is_some());
        assert!(!doc.has_field("tags"));
        let fallback = Value::String("none".into());
        assert_eq!(doc.get_field_or("missing", &fallback), &fallback);
    }

    #[test]
    fn refresh_hash_tracks_mutation() {
        let mut doc = TemplateDocument::parse(SAMPLE);
        let first = doc.refresh_hash().unwrap();
        assert_eq!(doc.stored_hash(), Some(first.as_str()));

        doc.set_field("audience", Value::String("internal".into()));
        let second = doc.refresh_hash().unwrap();
        assert_ne!(first, second);

        // Unchanged content rehashes to the same digest; the stored hash
        // itself never participates.
        let third = doc.refresh_hash().unwrap();
        assert_eq!(second, third);
    }

    #[test]
    fn deep_copy_is_independent() {
        let original = TemplateDocument::parse(SAMPLE);
        let mut copy = original.clone();
        copy.set_field("template_name", Value::String("other".into()));
        assert_eq!(original.get_str("template_name"), Some("greeter"));
    }
}
