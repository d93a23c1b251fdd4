//! Binstub generation for one or more gems of a bundle.

use anyhow::{bail, Context, Result};
use appbundle_pkg::{App, AppError, GemEnvironment, WriteOptions, WrittenStub, LOCK_FILE};
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Options for a generate run, after merging flags and configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Directory holding the bundle's `Gemfile.lock`.
    pub bundle_dir: PathBuf,
    /// Directory the binstubs are written to.
    pub binstub_dir: PathBuf,
    /// Gems to bundle. Empty means the bundle directory's name.
    pub gems: Vec<String>,
    /// Ruby interpreter for shebangs and wrappers.
    pub ruby: PathBuf,
    /// Gem directories to search. Empty means `GEM_HOME`/`GEM_PATH`.
    pub gem_path: Vec<PathBuf>,
    /// Write `.bat` wrappers.
    pub windows_wrappers: bool,
    /// Overwrite files not generated by appbundle.
    pub force: bool,
    /// Copy `Gemfile.lock` and `.bundle/` into each installed gem.
    pub copy_bundle_env: bool,
}

/// Result of a generate run.
#[derive(Debug, Default)]
pub struct GenerateResult {
    /// Stubs written, per gem.
    pub generated: Vec<(String, Vec<WrittenStub>)>,
    /// Existing files left untouched.
    pub skipped: Vec<PathBuf>,
    /// Gem directories the bundle environment was copied into.
    pub copied_env: Vec<PathBuf>,
}

impl GenerateResult {
    /// Print what was generated.
    pub fn print_summary(&self) {
        for (_, stubs) in &self.generated {
            for stub in stubs {
                println!(
                    "Generated binstub {} => {}",
                    stub.path.display(),
                    stub.entry_point.display()
                );
                if let Some(wrapper) = &stub.wrapper {
                    println!("Generated wrapper {}", wrapper.display());
                }
            }
        }

        for path in &self.skipped {
            println!(
                "Skipped {} (not generated by appbundle, use --force to overwrite)",
                path.display()
            );
        }
    }

    /// Total number of stubs written.
    #[must_use]
    pub fn stub_count(&self) -> usize {
        self.generated.iter().map(|(_, stubs)| stubs.len()).sum()
    }
}

/// Validate the directories, check every gem, then write all stubs.
///
/// No file is written unless every gem is installed and resolves with all
/// of its git-sourced dependencies accessible.
pub fn generate(options: &GenerateOptions) -> Result<GenerateResult> {
    let bundle_dir = verify_bundle_dir(&options.bundle_dir)?;
    let binstub_dir = verify_binstub_dir(&options.binstub_dir)?;
    let gems = gem_names(&options.gems, &bundle_dir)?;

    let locator = if options.gem_path.is_empty() {
        GemEnvironment::from_env()
    } else {
        GemEnvironment::new(options.gem_path.iter().cloned())
    };

    let apps: Vec<App> = gems
        .iter()
        .map(|name| {
            App::new(
                &bundle_dir,
                &binstub_dir,
                name.as_str(),
                &options.ruby,
                locator.clone(),
            )
        })
        .collect();

    for app in &apps {
        app.installed_spec().map_err(|e| match e {
            AppError::Gem(_) => anyhow::Error::new(e).context(
                "you must install the top-level app as a gem before calling appbundle",
            ),
            other => anyhow::Error::new(other)
                .context(format!("failed to load the bundle for '{}'", app.name())),
        })?;
    }

    for app in &apps {
        app.verify_deps_are_accessible()
            .with_context(|| format!("failed to verify dependencies of '{}'", app.name()))?;
    }

    let write_options = WriteOptions {
        windows_wrappers: options.windows_wrappers,
        force: options.force,
    };

    let mut result = GenerateResult::default();
    let mut wrapper_errors = Vec::new();
    for app in &apps {
        let report = app
            .write_executable_stubs(&write_options)
            .with_context(|| format!("failed to write binstubs for '{}'", app.name()))?;
        info!(gem = app.name(), count = report.written.len(), "generated binstubs");

        if let Some(e) = report.wrapper_error {
            wrapper_errors.push(anyhow::Error::new(e).context(format!(
                "failed to write .bat wrappers for '{}'",
                app.name()
            )));
        }
        result.skipped.extend(report.skipped);
        result.generated.push((app.name().to_string(), report.written));

        if options.copy_bundle_env {
            let copied = app
                .copy_bundle_env()
                .with_context(|| format!("failed to copy the bundle environment of '{}'", app.name()))?;
            result.copied_env.extend(copied);
        }
    }

    if !wrapper_errors.is_empty() {
        result.print_summary();
        let message = wrapper_errors
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("{message}");
    }

    Ok(result)
}

fn verify_bundle_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        bail!(
            "BUNDLE_DIR '{}' is not a directory or doesn't exist",
            path.display()
        );
    }
    if !path.join(LOCK_FILE).is_file() {
        bail!("BUNDLE_DIR '{}' does not contain {LOCK_FILE}", path.display());
    }
    absolute(path)
}

fn verify_binstub_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        bail!(
            "BINSTUB_DIR '{}' is not a directory or doesn't exist",
            path.display()
        );
    }
    absolute(path)
}

/// `path` made absolute against the working directory. `.` and `..` are
/// folded lexically and symlinks are left alone.
fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to read the working directory")?
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// The gems to bundle, defaulting to the bundle directory's name.
fn gem_names(gems: &[String], bundle_dir: &Path) -> Result<Vec<String>> {
    if !gems.is_empty() {
        return Ok(gems.to_vec());
    }

    let name = bundle_dir
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| {
            format!(
                "cannot derive a gem name from '{}', pass GEM_NAME explicitly",
                bundle_dir.display()
            )
        })?;
    Ok(vec![name.to_string()])
}
