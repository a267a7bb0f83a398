//! TemplateForge CLI - Build Dispatcher
//!
//! Commands: build, verify, types, upgrade
//! Validation failures are printed as data; non-zero exits signal raised
//! pipeline faults (and, for verify, missing or mistyped fields).

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use templateforge_core::{
    document::TemplateDocument,
    kinds::DocumentKind,
    pipeline::{BuildConfig, BuildPipeline, TEMPLATES_DIR},
    registry::Registry,
    upgrade::UpgradeEngine,
    verification::{diff_missing_fields, Verifier},
};

#[derive(Parser)]
#[command(name = "templateforge-cli")]
#[command(about = "TemplateForge CLI - Template Distribution Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root containing templates/, schema/ and dist/
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the versioned bundle
    Build {
        /// Explicit build number (default: auto-increment the persisted counter)
        #[arg(short, long)]
        build_number: Option<u64>,
    },

    /// Verify a single document and print its report
    Verify {
        /// Path to the document file
        document: PathBuf,

        /// Bundle directory; additionally diff missing fields against the
        /// previously built canonical instance of the document's type
        #[arg(long)]
        against_canonical: Option<PathBuf>,
    },

    /// List registry document types
    Types,

    /// Migrate a candidate document to the target schema version
    Upgrade {
        /// Path to the upgrade candidate
        candidate: PathBuf,

        /// Canonical document of the target version
        #[arg(long)]
        canonical: PathBuf,

        /// Output path (default: alongside the candidate, `.migrated.md`)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = BuildConfig::for_workspace(&cli.workspace);

    match cli.command {
        Commands::Build { build_number } => run_build(&config, build_number),
        Commands::Verify {
            document,
            against_canonical,
        } => run_verify(&config, &document, against_canonical.as_deref()),
        Commands::Types => run_types(&config),
        Commands::Upgrade {
            candidate,
            canonical,
            out,
        } => run_upgrade(&candidate, &canonical, out),
    }
}

fn run_build(config: &BuildConfig, build_number: Option<u64>) -> ExitCode {
    match BuildPipeline::new(config).run(build_number) {
        Ok(summary) => {
            println!(
                "build {} complete ({}): {} document(s) bundled, {} rejected",
                summary.build_number,
                summary.batch_id,
                summary.processed,
                summary.rejected.len()
            );
            for rejected in &summary.rejected {
                println!("rejected: {}", rejected.source);
                print!("{}", rejected.report.render());
            }
            if let Some(lockfile) = &summary.lockfile {
                println!("lockfile: {}", lockfile.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("build failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_verify(config: &BuildConfig, document: &Path, against: Option<&Path>) -> ExitCode {
    let registry = match Registry::load(&config.schema_path, &config.profiles_dir) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("verify failed: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let doc = match TemplateDocument::from_file(document) {
        Ok(d) => d,
        Err(err) => {
            eprintln!("verify failed: cannot read {}: {}", document.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let report = match Verifier::new(&registry).verify(&doc) {
        Ok(report) => report,
        Err(fault) => {
            eprintln!("verify failed: {}", fault);
            return ExitCode::FAILURE;
        }
    };
    print!("{}", report.render());

    if let Some(bundle_dir) = against {
        match find_canonical(bundle_dir, &doc) {
            Some(canonical) => {
                let diff = diff_missing_fields(&doc, &canonical);
                println!("  missing vs canonical: {:?}", diff);
            }
            None => println!("  missing vs canonical: no canonical instance found"),
        }
    }

    if report.blocks_verify() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

/// Locate the canonical instance of the document's type in a built bundle.
/// Prefers the document's own file name, falls back to the first document of
/// the same type in its category directory.
fn find_canonical(bundle_dir: &Path, document: &TemplateDocument) -> Option<TemplateDocument> {
    let tag = document.template_type()?;
    let kind = DocumentKind::from_tag(tag)?;
    let category_dir = bundle_dir.join(TEMPLATES_DIR).join(kind.category());

    if let Some(name) = document.file_name() {
        if let Ok(doc) = TemplateDocument::from_file(&category_dir.join(&name)) {
            if doc.template_type() == Some(tag) {
                return Some(doc);
            }
        }
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(&category_dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    paths.sort();
    for path in paths {
        if path.extension().map_or(true, |e| e != "md") {
            continue;
        }
        if let Ok(doc) = TemplateDocument::from_file(&path) {
            if doc.template_type() == Some(tag) {
                return Some(doc);
            }
        }
    }
    None
}

fn run_types(config: &BuildConfig) -> ExitCode {
    match Registry::load(&config.schema_path, &config.profiles_dir) {
        Ok(registry) => {
            let types: Vec<_> = registry
                .types()
                .map(|schema| {
                    serde_json::json!({
                        "tag": schema.tag,
                        "id": schema.id,
                        "fields": schema.fields.len(),
                        "required": schema.required_fields().len(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&types).unwrap());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("types failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_upgrade(candidate_path: &Path, canonical_path: &Path, out: Option<PathBuf>) -> ExitCode {
    let candidate = match TemplateDocument::from_file(candidate_path) {
        Ok(d) => d,
        Err(err) => {
            eprintln!(
                "upgrade failed: cannot read {}: {}",
                candidate_path.display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };
    let canonical = match TemplateDocument::from_file(canonical_path) {
        Ok(d) => d,
        Err(err) => {
            eprintln!(
                "upgrade failed: cannot read {}: {}",
                canonical_path.display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };

    let (migrated, report) = match UpgradeEngine::upgrade(&candidate, &canonical) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("upgrade failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let out_path = out.unwrap_or_else(|| candidate_path.with_extension("migrated.md"));
    let text = match migrated.to_markdown() {
        Ok(text) => text,
        Err(err) => {
            eprintln!("upgrade failed: cannot serialize migrated document: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = fs::write(&out_path, text) {
        eprintln!("upgrade failed: cannot write {}: {}", out_path.display(), err);
        return ExitCode::FAILURE;
    }

    println!("{}", serde_json::to_string_pretty(&report).unwrap());
    println!("migrated: {}", out_path.display());
    ExitCode::SUCCESS
}
