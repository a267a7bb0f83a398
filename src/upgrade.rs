//! Upgrade/Migration Engine
//!
//! Moves a loosely structured upgrade candidate onto the canonical document
//! of the target schema version. Canonical-only fields are copied forward,
//! candidate-only fields are reported but never removed, and a fixed set of
//! identity fields always tracks the target version.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

use crate::document::{
    TemplateDocument, FIELD_CATEGORY, FIELD_FAMILY, FIELD_FILENAME, FIELD_HASH, FIELD_NAME,
    FIELD_TYPE, FIELD_VERSION,
};

/// Fields force-overwritten from the canonical document regardless of what
/// the candidate declared.
pub const IDENTITY_FIELDS: [&str; 7] = [
    FIELD_CATEGORY,
    FIELD_FAMILY,
    FIELD_FILENAME,
    FIELD_HASH,
    FIELD_NAME,
    FIELD_TYPE,
    FIELD_VERSION,
];

/// Substituted for bare `---` lines in migrated bodies so the body cannot
/// collide with the frontmatter fence on re-parse.
pub const BODY_RULE_TOKEN: &str = "***";

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to rehash migrated document: {0}")]
    Rehash(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpgradeReport {
    pub backfilled_fields: Vec<String>,
    pub extra_fields: Vec<String>,
    pub overwritten_fields: Vec<String>,
}

pub struct UpgradeEngine;

impl UpgradeEngine {
    pub fn upgrade(
        candidate: &TemplateDocument,
        canonical: &TemplateDocument,
    ) -> Result<(TemplateDocument, UpgradeReport), UpgradeError> {
        let mut migrated = candidate.clone();
        let mut report = UpgradeReport::default();

        let canonical_keys = canonical.keys();

        for key in &canonical_keys {
            if !migrated.has_field(key) {
                let value = canonical
                    .get_field(key)
                    .cloned()
                    .unwrap_or(serde_yaml::Value::Null);
                migrated.set_field(key, value);
                report.backfilled_fields.push(key.clone());
            }
        }

        for field in IDENTITY_FIELDS {
            if let Some(value) = canonical.get_field(field) {
                if candidate.has_field(field) {
                    report.overwritten_fields.push(field.to_string());
                }
                migrated.set_field(field, value.clone());
            }
        }

        let canonical_set: BTreeSet<&String> = canonical_keys.iter().collect();
        report.extra_fields = migrated
            .keys()
            .into_iter()
            .filter(|k| !canonical_set.contains(k))
            .collect();

        migrated.set_body(normalize_horizontal_rules(migrated.body()));
        migrated.refresh_hash()?;

        Ok((migrated, report))
    }
}

/// Rewrite every bare horizontal-rule line to [`BODY_RULE_TOKEN`].
fn normalize_horizontal_rules(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.split_inclusive('\n') {
        let content = line.trim_end_matches('\n').trim_end_matches('\r');
        if content == "---" {
            out.push_str(BODY_RULE_TOKEN);
            out.push_str(&line[content.len()..]);
        } else {
            out.push_str(line);
        }
    }
    out
}
