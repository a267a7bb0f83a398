//! TemplateForge Core - Template Distribution Compiler
//!
//! # The Five Laws (Non-Negotiable)
//! 1. Frontmatter Is Truth
//! 2. Registries Are Contracts
//! 3. Validation Is Data, Not Exceptions
//! 4. Deterministic Hashes
//! 5. Lockfiles Make Bundles Tamper-Evident

pub mod document;
pub mod hashing;
pub mod kinds;
pub mod pipeline;
pub mod registry;
pub mod upgrade;
pub mod verification;
pub mod version;

pub use document::{ParseOutcome, TemplateDocument};
pub use hashing::{canonical_json, compute_file_hash, compute_template_hash, time_hash};
pub use kinds::{DocumentKind, KindProcessor, ProcessorTable};
pub use pipeline::{BuildConfig, BuildError, BuildPipeline, BuildSummary, BuildTokens};
pub use registry::{FieldSchemaEntry, FieldType, Registry, RegistryError, TypeProfile, TypeSchema};
pub use upgrade::{UpgradeEngine, UpgradeError, UpgradeReport};
pub use verification::{VerificationFault, VerificationReport, Verifier};
pub use version::BuildVersionManager;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_REGISTRY_VERSION: &str = "1.0.0";
