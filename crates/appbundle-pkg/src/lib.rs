//! Locked-closure binstubs for Ruby applications.
//!
//! This crate provides:
//! - Parsing of Bundler `Gemfile.lock` lockfiles
//! - Runtime dependency closure resolution from a root gem
//! - Discovery of installed gems and their executables
//! - Generation of binstubs that pin the closure at load time
//! - Optional `appbundle.toml` configuration

mod activate;
mod app;
mod binstub;
mod config;
mod gems;
mod lockfile;
mod resolve;

pub use activate::{pin_statement, ActivationScript, ALLOW_RVM_ENV, ENV_SANITIZER};
pub use app::{App, AppError, StubReport, WriteOptions, WrittenStub, BUNDLE_CONFIG_DIR};
pub use binstub::{
    batch_wrapper, dispatch_block, format_comment, is_batch_wrapper, relative_path, shebang,
    Binstub, BinstubHeader, StubError, BATCH_EXT, BINSTUB_FORMAT_VERSION,
};
pub use config::{Config, ConfigError, CONFIG_FILE};
pub use gems::{
    GemEnvironment, GemError, GemLocator, InstalledGem, DEFAULT_BIN_DIR, GEMSPEC_EXT, GEMS_DIR,
    SPECIFICATIONS_DIR,
};
pub use lockfile::{
    GitReference, LockedDependency, Lockfile, LockfileError, PackageRecord, Source, LOCK_FILE,
};
pub use resolve::{
    DependencyClosure, InaccessibleGem, InaccessibleGems, PackageLookup, ResolveError, Resolver,
    BUNDLER_GEM,
};
