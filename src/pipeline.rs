//! Build Pipeline - Document Set to Versioned Bundle
//!
//! One build run is a fixed-order state machine:
//! `Initialize(version) -> ProcessDocuments -> BuildRegistrySnapshot ->
//! BuildManifest -> BuildLockfile -> Finalize`. Each stage consumes the
//! shared token map and produces its output file; the lockfile stage runs
//! last because it hashes the artifacts the earlier stages wrote.
//!
//! Document validation is the pass/fail gate. Companion artifacts are
//! best-effort: a file that cannot be hashed is logged and its hash field
//! omitted, never aborting the run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document::{
    TemplateDocument, FIELD_ID, FIELD_NAME, FIELD_REGISTRY, FIELD_VERSION,
};
use crate::hashing::{compute_file_hash, time_hash};
use crate::kinds::{DocumentKind, ProcessorTable};
use crate::registry::{Registry, RegistryError};
use crate::verification::{VerificationFault, VerificationReport, Verifier};
use crate::version::BuildVersionManager;
use crate::ENGINE_VERSION;

pub const REGISTRY_SNAPSHOT_FILE: &str = "template_registry.yaml";
pub const MANIFEST_FILE: &str = "template_manifest.yaml";
pub const LOCKFILE_FILE: &str = "template_lock.yaml";
pub const TEMPLATES_DIR: &str = "templates";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("source root {0} does not exist")]
    MissingSourceRoot(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("verification fault for {path}: {source}")]
    Verification {
        path: String,
        #[source]
        source: VerificationFault,
    },

    #[error("serialization failure in stage {stage}: {message}")]
    Serialization { stage: &'static str, message: String },

    #[error("required stage token missing: {0}")]
    MissingToken(&'static str),

    #[error("builder {current} is older than registry minimum {minimum}")]
    BuilderTooOld { current: String, minimum: String },
}

/// Immutable configuration for one build run. Constructed explicitly and
/// passed by reference into each component; there is no ambient state.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub source_root: PathBuf,
    pub schema_path: PathBuf,
    pub profiles_dir: PathBuf,
    pub output_dir: PathBuf,
    pub counter_path: PathBuf,
    pub package_version: String,
    pub batch_prefix: String,
    pub strict_hash_mode: bool,
    pub force_invalidate_previous: bool,
    pub enforce_strict_bundle_boundary: bool,
}

impl BuildConfig {
    /// Conventional layout under one workspace root.
    pub fn for_workspace(root: &Path) -> Self {
        Self {
            source_root: root.join("templates"),
            schema_path: root.join("schema").join("template_schema.yaml"),
            profiles_dir: root.join("schema").join("profiles"),
            output_dir: root.join("dist"),
            counter_path: root.join(".build_version"),
            package_version: ENGINE_VERSION.to_string(),
            batch_prefix: "tf".to_string(),
            strict_hash_mode: true,
            force_invalidate_previous: false,
            enforce_strict_bundle_boundary: true,
        }
    }
}

/// Token map shared by every stage.
#[derive(Debug, Clone, Serialize)]
pub struct BuildTokens {
    pub build_number: u64,
    pub batch_hash: String,
    pub timestamp: DateTime<Utc>,
    pub builder_version: String,
}

impl BuildTokens {
    /// Human-legible batch identifier: `<prefix>-<build>-<timehash>`.
    pub fn batch_id(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.build_number, self.batch_hash)
    }
}

/// A document that passed the gate and entered the bundle.
#[derive(Debug)]
pub struct ProcessedDocument {
    pub document: TemplateDocument,
    pub kind: DocumentKind,
    pub output_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RejectedDocument {
    pub source: String,
    pub report: VerificationReport,
}

/// Mutable run state threaded through the stages.
pub struct BuildContext<'c> {
    pub config: &'c BuildConfig,
    pub tokens: BuildTokens,
    pub registry: Registry,
    pub processors: &'c ProcessorTable,
    pub documents: Vec<ProcessedDocument>,
    pub rejected: Vec<RejectedDocument>,
    pub skipped_dirs: Vec<String>,
    pub registry_snapshot_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub lockfile_path: Option<PathBuf>,
}

pub trait BuildStage {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError>;
}

#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub build_number: u64,
    pub batch_id: String,
    pub processed: usize,
    pub rejected: Vec<RejectedDocument>,
    pub skipped_dirs: Vec<String>,
    pub output_dir: PathBuf,
    pub lockfile: Option<PathBuf>,
}

pub struct BuildPipeline<'c> {
    config: &'c BuildConfig,
    processors: ProcessorTable,
}

impl<'c> BuildPipeline<'c> {
    pub fn new(config: &'c BuildConfig) -> Self {
        Self {
            config,
            processors: ProcessorTable::standard(),
        }
    }

    /// Run a full build. `build_override` consumes an explicit build number;
    /// otherwise the persisted counter is incremented and re-persisted.
    pub fn run(&self, build_override: Option<u64>) -> Result<BuildSummary, BuildError> {
        // Initialize(version)
        let registry = Registry::load(&self.config.schema_path, &self.config.profiles_dir)?;
        check_builder_version(&registry)?;

        let mut manager = BuildVersionManager::new(&self.config.counter_path);
        let build_number = match build_override {
            Some(number) => {
                manager.set_current(number);
                number
            }
            None => {
                let number = manager.get_next_version();
                manager.save_current_version().map_err(|source| BuildError::Io {
                    path: self.config.counter_path.display().to_string(),
                    source,
                })?;
                number
            }
        };

        let timestamp = Utc::now();
        let tokens = BuildTokens {
            build_number,
            batch_hash: time_hash(&timestamp),
            timestamp,
            builder_version: ENGINE_VERSION.to_string(),
        };

        let mut registry = registry;
        registry.set_build_number(build_number);

        fs::create_dir_all(&self.config.output_dir).map_err(|source| BuildError::Io {
            path: self.config.output_dir.display().to_string(),
            source,
        })?;

        let mut ctx = BuildContext {
            config: self.config,
            tokens,
            registry,
            processors: &self.processors,
            documents: Vec::new(),
            rejected: Vec::new(),
            skipped_dirs: Vec::new(),
            registry_snapshot_path: None,
            manifest_path: None,
            lockfile_path: None,
        };

        let stages: [&dyn BuildStage; 5] = [
            &ProcessDocumentsStage,
            &RegistrySnapshotStage,
            &ManifestStage,
            &LockfileStage,
            &FinalizeStage,
        ];
        for stage in stages {
            debug!(stage = stage.name(), "stage start");
            stage.run(&mut ctx)?;
        }

        Ok(BuildSummary {
            build_number: ctx.tokens.build_number,
            batch_id: ctx.tokens.batch_id(&self.config.batch_prefix),
            processed: ctx.documents.len(),
            rejected: ctx.rejected,
            skipped_dirs: ctx.skipped_dirs,
            output_dir: self.config.output_dir.clone(),
            lockfile: ctx.lockfile_path,
        })
    }
}

fn check_builder_version(registry: &Registry) -> Result<(), BuildError> {
    let Some(minimum) = &registry.min_builder_version else {
        return Ok(());
    };
    let current = semver::Version::parse(ENGINE_VERSION).map_err(|_| BuildError::Serialization {
        stage: "Initialize",
        message: "invalid builder version".to_string(),
    })?;
    if &current < minimum {
        return Err(BuildError::BuilderTooOld {
            current: current.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}

// --- ProcessDocuments ---

struct ProcessDocumentsStage;

impl BuildStage for ProcessDocumentsStage {
    fn name(&self) -> &'static str {
        "ProcessDocuments"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let root = &ctx.config.source_root;
        if !root.exists() {
            return Err(BuildError::MissingSourceRoot(root.display().to_string()));
        }

        let verifier_registry = ctx.registry.clone();
        let verifier = Verifier::new(&verifier_registry);

        for dir in sorted_entries(root)? {
            if !dir.is_dir() {
                continue;
            }
            let tag = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(kind) = DocumentKind::from_tag(&tag) else {
                warn!(directory = %dir.display(), "no registered document kind; skipping");
                ctx.skipped_dirs.push(tag);
                continue;
            };
            let Some(schema) = verifier_registry.get(&tag) else {
                warn!(%tag, "registered kind has no registry entry; skipping");
                ctx.skipped_dirs.push(tag);
                continue;
            };
            let Some(processor) = ctx.processors.get(kind) else {
                warn!(%tag, "no processor registered for kind; skipping");
                ctx.skipped_dirs.push(tag);
                continue;
            };

            for file in sorted_entries(&dir)? {
                if file.extension().map_or(true, |e| e != "md") {
                    continue;
                }
                let mut document =
                    TemplateDocument::from_file(&file).map_err(|source| BuildError::Io {
                        path: file.display().to_string(),
                        source,
                    })?;
                debug!(file = %file.display(), outcome = ?document.outcome(), "parsed");

                processor.prepare(&mut document, schema);

                let report =
                    verifier
                        .verify(&document)
                        .map_err(|source| BuildError::Verification {
                            path: file.display().to_string(),
                            source,
                        })?;
                if !report.is_pass() {
                    warn!(file = %file.display(), "verification failed; excluded from bundle");
                    ctx.rejected.push(RejectedDocument {
                        source: file.display().to_string(),
                        report,
                    });
                    continue;
                }

                inject_registry_link(&mut document, ctx);
                document
                    .refresh_hash()
                    .map_err(|err| BuildError::Serialization {
                        stage: "ProcessDocuments",
                        message: err.to_string(),
                    })?;

                let output_path = write_processed(&document, kind, ctx.config)?;
                ctx.documents.push(ProcessedDocument {
                    document,
                    kind,
                    output_path,
                });
            }
        }

        info!(
            processed = ctx.documents.len(),
            rejected = ctx.rejected.len(),
            "documents processed"
        );
        Ok(())
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let entries = fs::read_dir(dir).map_err(|source| BuildError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BuildError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn inject_registry_link(document: &mut TemplateDocument, ctx: &BuildContext<'_>) {
    let mut link = Mapping::new();
    link.insert(
        Value::String("file".to_string()),
        Value::String(REGISTRY_SNAPSHOT_FILE.to_string()),
    );
    link.insert(
        Value::String("registry_id".to_string()),
        Value::String(ctx.registry.id.clone()),
    );
    link.insert(
        Value::String("enforced".to_string()),
        Value::Bool(ctx.config.enforce_strict_bundle_boundary),
    );
    document.set_field(FIELD_REGISTRY, Value::Mapping(link));
}

fn write_processed(
    document: &TemplateDocument,
    kind: DocumentKind,
    config: &BuildConfig,
) -> Result<PathBuf, BuildError> {
    let file_name = document
        .file_name()
        .unwrap_or_else(|| "unnamed.md".to_string());
    let dir = config
        .output_dir
        .join(TEMPLATES_DIR)
        .join(kind.category());
    fs::create_dir_all(&dir).map_err(|source| BuildError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let path = dir.join(file_name);
    let text = document
        .to_markdown()
        .map_err(|err| BuildError::Serialization {
            stage: "ProcessDocuments",
            message: err.to_string(),
        })?;
    fs::write(&path, text).map_err(|source| BuildError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(path)
}

// --- BuildRegistrySnapshot ---

#[derive(Serialize)]
struct RegistrySnapshot {
    registry: RegistrySnapshotInfo,
    types: BTreeMap<String, TypeSnapshot>,
    cross_reference: CrossReference,
    field_matrix: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct RegistrySnapshotInfo {
    id: String,
    name: String,
    version: String,
    build_number: u64,
    generated_at: String,
}

#[derive(Serialize)]
struct TypeSnapshot {
    id: String,
    fields: BTreeMap<String, FieldSnapshot>,
}

#[derive(Serialize)]
struct FieldSnapshot {
    #[serde(rename = "type")]
    field_type: String,
    required: bool,
    autofill: bool,
    deprecated: bool,
    nullable: bool,
}

#[derive(Serialize)]
struct CrossReference {
    id_to_type: BTreeMap<String, String>,
    type_to_id: BTreeMap<String, String>,
}

struct RegistrySnapshotStage;

impl BuildStage for RegistrySnapshotStage {
    fn name(&self) -> &'static str {
        "BuildRegistrySnapshot"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let mut types = BTreeMap::new();
        let mut id_to_type = BTreeMap::new();
        let mut type_to_id = BTreeMap::new();
        let mut field_matrix = BTreeMap::new();

        for schema in ctx.registry.types() {
            let mut fields = BTreeMap::new();
            let mut matrix_row = BTreeMap::new();
            for entry in schema.fields.values() {
                fields.insert(
                    entry.name.clone(),
                    FieldSnapshot {
                        field_type: entry.field_type.label(),
                        required: entry.required,
                        autofill: entry.autofill,
                        deprecated: entry.deprecated,
                        nullable: entry.nullable,
                    },
                );
                matrix_row.insert(entry.name.clone(), entry.field_type.label());
            }
            types.insert(
                schema.tag.clone(),
                TypeSnapshot {
                    id: schema.id.clone(),
                    fields,
                },
            );
            id_to_type.insert(schema.id.clone(), schema.tag.clone());
            type_to_id.insert(schema.tag.clone(), schema.id.clone());
            field_matrix.insert(schema.tag.clone(), matrix_row);
        }

        let snapshot = RegistrySnapshot {
            registry: RegistrySnapshotInfo {
                id: ctx.registry.id.clone(),
                name: ctx.registry.name.clone(),
                version: ctx.registry.version.to_string(),
                build_number: ctx.tokens.build_number,
                generated_at: ctx.tokens.timestamp.to_rfc3339(),
            },
            types,
            cross_reference: CrossReference {
                id_to_type,
                type_to_id,
            },
            field_matrix,
        };

        let path = ctx.config.output_dir.join(REGISTRY_SNAPSHOT_FILE);
        write_yaml(&path, &snapshot, self.name())?;
        ctx.registry_snapshot_path = Some(path);
        Ok(())
    }
}

// --- BuildManifest ---

#[derive(Serialize)]
struct Manifest {
    package_version: String,
    build_number: u64,
    batch_hash: String,
    generated_at: String,
    categories: BTreeMap<String, BTreeMap<String, ManifestEntry>>,
}

#[derive(Serialize)]
struct ManifestEntry {
    name: String,
    id: String,
    category: String,
    #[serde(rename = "type")]
    template_type: String,
    version: String,
    source_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    declared_fields: Vec<String>,
}

struct ManifestStage;

impl BuildStage for ManifestStage {
    fn name(&self) -> &'static str {
        "BuildManifest"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let mut categories: BTreeMap<String, BTreeMap<String, ManifestEntry>> = BTreeMap::new();

        for processed in &ctx.documents {
            let document = &processed.document;
            let identifier = document
                .get_str(FIELD_ID)
                .or_else(|| document.get_str(FIELD_NAME))
                .map(str::to_string)
                .or_else(|| document.file_name())
                .unwrap_or_else(|| "unnamed".to_string());

            let declared_fields = ctx
                .registry
                .get(processed.kind.tag())
                .map(|schema| {
                    schema
                        .non_deprecated_fields()
                        .into_iter()
                        .filter(|f| document.has_field(f))
                        .collect()
                })
                .unwrap_or_default();

            let entry = ManifestEntry {
                name: document
                    .get_str(FIELD_NAME)
                    .unwrap_or(identifier.as_str())
                    .to_string(),
                id: identifier.clone(),
                category: processed.kind.category().to_string(),
                template_type: processed.kind.tag().to_string(),
                version: document
                    .get_str(FIELD_VERSION)
                    .unwrap_or_default()
                    .to_string(),
                source_file: document.file_name().unwrap_or_default(),
                hash: document.stored_hash().map(str::to_string),
                declared_fields,
            };

            categories
                .entry(processed.kind.category().to_string())
                .or_default()
                .insert(identifier, entry);
        }

        let manifest = Manifest {
            package_version: ctx.config.package_version.clone(),
            build_number: ctx.tokens.build_number,
            batch_hash: ctx.tokens.batch_hash.clone(),
            generated_at: ctx.tokens.timestamp.to_rfc3339(),
            categories,
        };

        let path = ctx.config.output_dir.join(MANIFEST_FILE);
        write_yaml(&path, &manifest, self.name())?;
        ctx.manifest_path = Some(path);
        Ok(())
    }
}

// --- BuildLockfile ---

#[derive(Serialize)]
struct Lockfile {
    package_version: String,
    build_number: u64,
    batch_id: String,
    generated_at: String,
    registry: RegistryLock,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_hash: Option<String>,
    flags: LockFlags,
}

#[derive(Serialize)]
struct RegistryLock {
    id: String,
    name: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_hash: Option<String>,
}

#[derive(Serialize)]
struct LockFlags {
    strict_hash_mode: bool,
    force_invalidate_previous: bool,
    enforce_strict_bundle_boundary: bool,
}

struct LockfileStage;

impl BuildStage for LockfileStage {
    fn name(&self) -> &'static str {
        "BuildLockfile"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let manifest_path = ctx
            .manifest_path
            .as_ref()
            .ok_or(BuildError::MissingToken("manifest_path"))?;
        let snapshot_path = ctx
            .registry_snapshot_path
            .as_ref()
            .ok_or(BuildError::MissingToken("registry_snapshot_path"))?;

        let lockfile = Lockfile {
            package_version: ctx.config.package_version.clone(),
            build_number: ctx.tokens.build_number,
            batch_id: ctx.tokens.batch_id(&ctx.config.batch_prefix),
            generated_at: ctx.tokens.timestamp.to_rfc3339(),
            registry: RegistryLock {
                id: ctx.registry.id.clone(),
                name: ctx.registry.name.clone(),
                version: ctx.registry.version.to_string(),
                source_hash: best_effort_hash(&ctx.config.schema_path),
                snapshot_hash: best_effort_hash(snapshot_path),
            },
            manifest_hash: best_effort_hash(manifest_path),
            flags: LockFlags {
                strict_hash_mode: ctx.config.strict_hash_mode,
                force_invalidate_previous: ctx.config.force_invalidate_previous,
                enforce_strict_bundle_boundary: ctx.config.enforce_strict_bundle_boundary,
            },
        };

        let path = ctx.config.output_dir.join(LOCKFILE_FILE);
        write_yaml(&path, &lockfile, self.name())?;
        ctx.lockfile_path = Some(path);
        Ok(())
    }
}

/// Hash an artifact expected on disk. Absence degrades to `None` with a
/// diagnostic; the lockfile simply omits the field.
fn best_effort_hash(path: &Path) -> Option<String> {
    match compute_file_hash(path) {
        Ok(hash) => Some(hash),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "artifact not hashable; omitting hash");
            None
        }
    }
}

// --- Finalize ---

struct FinalizeStage;

impl BuildStage for FinalizeStage {
    fn name(&self) -> &'static str {
        "Finalize"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let lockfile = ctx
            .lockfile_path
            .as_ref()
            .ok_or(BuildError::MissingToken("lockfile_path"))?;
        info!(
            build = ctx.tokens.build_number,
            batch = %ctx.tokens.batch_id(&ctx.config.batch_prefix),
            lockfile = %lockfile.display(),
            processed = ctx.documents.len(),
            rejected = ctx.rejected.len(),
            "bundle finalized"
        );
        Ok(())
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T, stage: &'static str) -> Result<(), BuildError> {
    let text = serde_yaml::to_string(value).map_err(|err| BuildError::Serialization {
        stage,
        message: err.to_string(),
    })?;
    fs::write(path, text).map_err(|source| BuildError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
registry:
  id: tf-main
  name: Test Registry
  version: 1.4.0
types:
  prompt:
    fields:
      template_name: { type: string, required: true }
      template_id: { type: string, required: true }
      template_type: { type: string, autofill: true }
      template_version: { type: string, required: true }
      template_category: { type: string, autofill: true }
      template_family: { type: string, autofill: true }
      template_filename: { type: string, autofill: true }
      template_hash: { type: string }
      template_registry: { type: map }
      tags: { type: "list[string]", autofill: true }
"#;

    fn workspace() -> (tempfile::TempDir, BuildConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("schema")).unwrap();
        fs::write(root.join("schema").join("template_schema.yaml"), SCHEMA).unwrap();
        fs::create_dir_all(root.join("templates").join("prompt")).unwrap();
        fs::write(
            root.join("templates").join("prompt").join("greeter.md"),
            "---\ntemplate_name: greeter\ntemplate_id: greeter-01\ntemplate_version: 1.0.0\n---\nSay hello.\n",
        )
        .unwrap();
        let config = BuildConfig::for_workspace(root);
        (dir, config)
    }

    #[test]
    fn batch_id_format() {
        let tokens = BuildTokens {
            build_number: 12,
            batch_hash: "abc123def0".to_string(),
            timestamp: Utc::now(),
            builder_version: ENGINE_VERSION.to_string(),
        };
        assert_eq!(tokens.batch_id("tf"), "tf-12-abc123def0");
    }

    #[test]
    fn full_run_produces_all_artifacts() {
        let (_dir, config) = workspace();
        let summary = BuildPipeline::new(&config).run(None).unwrap();

        assert_eq!(summary.build_number, 1);
        assert_eq!(summary.processed, 1);
        assert!(summary.rejected.is_empty());
        assert!(config.output_dir.join(REGISTRY_SNAPSHOT_FILE).exists());
        assert!(config.output_dir.join(MANIFEST_FILE).exists());
        assert!(config.output_dir.join(LOCKFILE_FILE).exists());
        assert!(config
            .output_dir
            .join(TEMPLATES_DIR)
            .join("prompts")
            .join("greeter.md")
            .exists());
    }

    #[test]
    fn lockfile_pins_manifest_and_snapshot_hashes() {
        let (_dir, config) = workspace();
        BuildPipeline::new(&config).run(None).unwrap();

        let lock_text = fs::read_to_string(config.output_dir.join(LOCKFILE_FILE)).unwrap();
        let lock: serde_yaml::Value = serde_yaml::from_str(&lock_text).unwrap();

        let manifest_hash = lock["manifest_hash"].as_str().unwrap();
        let recomputed = compute_file_hash(&config.output_dir.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest_hash, recomputed);

        let snapshot_hash = lock["registry"]["snapshot_hash"].as_str().unwrap();
        let recomputed =
            compute_file_hash(&config.output_dir.join(REGISTRY_SNAPSHOT_FILE)).unwrap();
        assert_eq!(snapshot_hash, recomputed);
    }

    #[test]
    fn failing_document_is_excluded_not_fatal() {
        let (dir, config) = workspace();
        fs::write(
            dir.path().join("templates").join("prompt").join("broken.md"),
            "---\ntemplate_name: broken\n---\nNo id or version.\n",
        )
        .unwrap();

        let summary = BuildPipeline::new(&config).run(None).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.rejected.len(), 1);
        let report = &summary.rejected[0].report;
        assert!(report
            .missing_fields
            .contains(&"template_id".to_string()));
    }

    #[test]
    fn unknown_type_directory_is_skipped_with_warning() {
        let (dir, config) = workspace();
        fs::create_dir_all(dir.path().join("templates").join("sonnet")).unwrap();
        fs::write(
            dir.path().join("templates").join("sonnet").join("x.md"),
            "---\na: 1\n---\n",
        )
        .unwrap();

        let summary = BuildPipeline::new(&config).run(None).unwrap();
        assert_eq!(summary.skipped_dirs, vec!["sonnet"]);
    }

    #[test]
    fn build_override_skips_counter() {
        let (_dir, config) = workspace();
        let summary = BuildPipeline::new(&config).run(Some(42)).unwrap();
        assert_eq!(summary.build_number, 42);
        assert!(!config.counter_path.exists());

        // Next auto build starts from the untouched counter.
        let summary = BuildPipeline::new(&config).run(None).unwrap();
        assert_eq!(summary.build_number, 1);
    }

    #[test]
    fn registry_version_patch_is_build_scoped() {
        let (_dir, config) = workspace();
        BuildPipeline::new(&config).run(Some(9)).unwrap();

        let text =
            fs::read_to_string(config.output_dir.join(REGISTRY_SNAPSHOT_FILE)).unwrap();
        let snapshot: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(snapshot["registry"]["version"].as_str(), Some("1.4.9"));
    }

    #[test]
    fn lockfile_degrades_when_companion_vanishes() {
        let (_dir, config) = workspace();
        fs::create_dir_all(&config.output_dir).unwrap();

        let registry = Registry::parse(SCHEMA, "inline").unwrap();
        let processors = ProcessorTable::standard();
        let mut ctx = BuildContext {
            config: &config,
            tokens: BuildTokens {
                build_number: 1,
                batch_hash: "0123456789".to_string(),
                timestamp: Utc::now(),
                builder_version: ENGINE_VERSION.to_string(),
            },
            registry,
            processors: &processors,
            documents: Vec::new(),
            rejected: Vec::new(),
            skipped_dirs: Vec::new(),
            registry_snapshot_path: Some(config.output_dir.join("missing_snapshot.yaml")),
            manifest_path: Some(config.output_dir.join("missing_manifest.yaml")),
            lockfile_path: None,
        };

        LockfileStage.run(&mut ctx).unwrap();

        let text = fs::read_to_string(config.output_dir.join(LOCKFILE_FILE)).unwrap();
        let lock: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert!(lock.get("manifest_hash").is_none());
        assert!(lock["registry"].get("snapshot_hash").is_none());
        // Schema file exists, so the source hash is still pinned.
        assert!(lock["registry"]["source_hash"].as_str().is_some());
    }

    #[test]
    fn lockfile_without_manifest_token_is_a_fault() {
        let (_dir, config) = workspace();
        fs::create_dir_all(&config.output_dir).unwrap();
        let registry = Registry::parse(SCHEMA, "inline").unwrap();
        let processors = ProcessorTable::standard();
        let mut ctx = BuildContext {
            config: &config,
            tokens: BuildTokens {
                build_number: 1,
                batch_hash: "0123456789".to_string(),
                timestamp: Utc::now(),
                builder_version: ENGINE_VERSION.to_string(),
            },
            registry,
            processors: &processors,
            documents: Vec::new(),
            rejected: Vec::new(),
            skipped_dirs: Vec::new(),
            registry_snapshot_path: None,
            manifest_path: None,
            lockfile_path: None,
        };
        let err = LockfileStage.run(&mut ctx).unwrap_err();
        assert!(matches!(err, BuildError::MissingToken(_)));
    }
}
