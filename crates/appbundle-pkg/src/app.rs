//! One application bundling session.
//!
//! An [`App`] ties a root gem to the bundle directory holding its
//! `Gemfile.lock` and to the directory receiving its binstubs. The lockfile
//! is parsed at most once and the activation script is rendered at most
//! once per session, so every stub written by the same `App` embeds
//! byte-identical activation code.

use crate::activate::ActivationScript;
use crate::binstub::{
    batch_wrapper, is_batch_wrapper, relative_path, Binstub, BinstubHeader, StubError, BATCH_EXT,
};
use crate::gems::{GemEnvironment, GemError, GemLocator, InstalledGem};
use crate::lockfile::{Lockfile, LockfileError, PackageRecord, LOCK_FILE};
use crate::resolve::{DependencyClosure, PackageLookup, ResolveError, Resolver};
use once_cell::unsync::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bundler's per-project settings directory.
pub const BUNDLE_CONFIG_DIR: &str = ".bundle";

/// Errors returned by [`App`] operations.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Gem(#[from] GemError),

    #[error(transparent)]
    Stub(#[from] StubError),

    #[error("failed to copy '{}' to '{}': {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Options for [`App::write_executable_stubs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Write a `.bat` wrapper next to every stub.
    pub windows_wrappers: bool,
    /// Overwrite files that were not generated by appbundle.
    pub force: bool,
}

/// A stub written to the target bin directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenStub {
    /// The generated stub.
    pub path: PathBuf,
    /// The executable inside the installed gem it dispatches to.
    pub entry_point: PathBuf,
    /// The `.bat` wrapper, if one was written.
    pub wrapper: Option<PathBuf>,
}

/// What [`App::write_executable_stubs`] did.
#[derive(Debug, Default)]
pub struct StubReport {
    /// Stubs written, in executable order.
    pub written: Vec<WrittenStub>,
    /// Existing foreign files that were left alone.
    pub skipped: Vec<PathBuf>,
    /// Set when `.bat` wrappers were requested but the ruby path could not
    /// be made relative to the bin directory. The stubs themselves are
    /// still written.
    pub wrapper_error: Option<StubError>,
}

/// A root gem bundled into a target bin directory.
#[derive(Debug)]
pub struct App<L: GemLocator = GemEnvironment> {
    bundle_path: PathBuf,
    target_bin_dir: PathBuf,
    name: String,
    ruby: PathBuf,
    locator: L,
    lockfile: OnceCell<Lockfile>,
    activation: OnceCell<ActivationScript>,
}

impl<L: GemLocator> App<L> {
    /// Create a session for `name`, whose lockfile lives in `bundle_path`.
    pub fn new(
        bundle_path: impl Into<PathBuf>,
        target_bin_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        ruby: impl Into<PathBuf>,
        locator: L,
    ) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            target_bin_dir: target_bin_dir.into(),
            name: name.into(),
            ruby: ruby.into(),
            locator,
            lockfile: OnceCell::new(),
            activation: OnceCell::new(),
        }
    }

    /// Use an already parsed lockfile instead of reading one from disk.
    #[must_use]
    pub fn with_lockfile(self, lockfile: Lockfile) -> Self {
        Self {
            lockfile: OnceCell::with_value(lockfile),
            ..self
        }
    }

    /// The root gem name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding the bundle's `Gemfile.lock`.
    #[must_use]
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// The directory binstubs are written to.
    #[must_use]
    pub fn target_bin_dir(&self) -> &Path {
        &self.target_bin_dir
    }

    /// The ruby interpreter used in shebangs and wrappers.
    #[must_use]
    pub fn ruby(&self) -> &Path {
        &self.ruby
    }

    /// The installed gem locator.
    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Path of the bundle's lockfile.
    #[must_use]
    pub fn lockfile_path(&self) -> PathBuf {
        self.bundle_path.join(LOCK_FILE)
    }

    /// The parsed lockfile, read on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the lockfile cannot be read or parsed.
    pub fn lockfile(&self) -> Result<&Lockfile, AppError> {
        Ok(self.lockfile.get_or_try_init(|| {
            let path = self.lockfile_path();
            debug!(path = %path.display(), "reading lockfile");
            Lockfile::from_path(path)
        })?)
    }

    /// The root gem's locked record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lockfile is unreadable or does not lock the
    /// root gem.
    pub fn app_spec(&self) -> Result<&PackageRecord, AppError> {
        Ok(self.lockfile()?.lookup(&self.name)?)
    }

    /// The runtime closure of the root gem.
    ///
    /// # Errors
    ///
    /// Returns an error if the root or a reachable dependency is not locked.
    pub fn runtime_dependencies(&self) -> Result<DependencyClosure<'_>, AppError> {
        Ok(Resolver::new(self.lockfile()?).resolve(&self.name)?)
    }

    /// The activation script pinning the runtime closure, rendered once.
    ///
    /// # Errors
    ///
    /// Returns an error if the closure cannot be resolved.
    pub fn runtime_activate(&self) -> Result<&ActivationScript, AppError> {
        self.activation.get_or_try_init(|| {
            let closure = self.runtime_dependencies()?;
            Ok(ActivationScript::render(&closure))
        })
    }

    /// Check that RubyGems can load every git-sourced gem of the closure.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Inaccessible`] (wrapped) naming every gem
    /// that is not installed.
    pub fn verify_deps_are_accessible(&self) -> Result<(), AppError> {
        let closure = self.runtime_dependencies()?;
        closure.verify_accessible(&self.locator, &self.name, self.lockfile_path())?;
        Ok(())
    }

    /// The installed copy of the root gem at its locked version.
    ///
    /// # Errors
    ///
    /// Returns [`GemError::NotInstalled`] (wrapped) if it is not installed.
    pub fn installed_spec(&self) -> Result<InstalledGem, AppError> {
        let spec = self.app_spec()?;
        Ok(self.locator.require(&spec.name, &spec.version)?)
    }

    /// The executables of the installed root gem.
    ///
    /// # Errors
    ///
    /// Returns an error if the gem is not installed or cannot be read.
    pub fn executables(&self) -> Result<Vec<PathBuf>, AppError> {
        Ok(self.installed_spec()?.executables()?)
    }

    /// The binstub dispatching to `entry_point`.
    ///
    /// # Errors
    ///
    /// Returns an error if the closure cannot be resolved or `entry_point`
    /// has no file name.
    pub fn binstub(&self, entry_point: &Path) -> Result<Binstub, AppError> {
        Ok(Binstub::assemble(
            &self.ruby,
            self.runtime_activate()?,
            self.app_spec()?,
            entry_point,
        )?)
    }

    /// The ruby interpreter relative to the target bin directory.
    ///
    /// # Errors
    ///
    /// Returns [`StubError::PathResolution`] if no relative path exists.
    pub fn ruby_relative_path(&self) -> Result<PathBuf, StubError> {
        relative_path(&self.ruby, &self.target_bin_dir)
    }

    /// The `.bat` wrapper text shared by every stub of this app.
    ///
    /// # Errors
    ///
    /// Returns [`StubError::PathResolution`] if no relative path exists.
    pub fn batchfile_stub(&self) -> Result<String, StubError> {
        batch_wrapper(&self.ruby, &self.target_bin_dir)
    }

    /// Write one binstub per executable into the target bin directory.
    ///
    /// Existing files are replaced only when they were generated by
    /// appbundle, unless `options.force` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if a stub cannot be assembled or written. A wrapper
    /// path failure is reported in [`StubReport::wrapper_error`] instead.
    pub fn write_executable_stubs(&self, options: &WriteOptions) -> Result<StubReport, AppError> {
        let mut report = StubReport::default();

        let wrapper = if options.windows_wrappers {
            match self.batchfile_stub() {
                Ok(text) => Some(text),
                Err(e) => {
                    report.wrapper_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        for entry_point in self.executables()? {
            let stub = self.binstub(&entry_point)?;
            let path = self.target_bin_dir.join(&stub.name);

            if !options.force && is_foreign(&path, is_binstub) {
                warn!(path = %path.display(), "not overwriting file that was not generated by appbundle");
                report.skipped.push(path);
                continue;
            }

            write_file(&path, &stub.content)?;
            set_mode(&path, 0o755)?;
            info!(stub = %path.display(), entry_point = %entry_point.display(), "wrote binstub");

            let wrapper_path = match &wrapper {
                Some(text) => {
                    let wrapper_path = self.target_bin_dir.join(format!("{}.{BATCH_EXT}", stub.name));
                    if !options.force && is_foreign(&wrapper_path, is_batch_wrapper) {
                        warn!(path = %wrapper_path.display(), "not overwriting file that was not generated by appbundle");
                        report.skipped.push(wrapper_path);
                        None
                    } else {
                        write_file(&wrapper_path, text)?;
                        info!(wrapper = %wrapper_path.display(), "wrote batch wrapper");
                        Some(wrapper_path)
                    }
                }
                None => None,
            };

            report.written.push(WrittenStub {
                path,
                entry_point,
                wrapper: wrapper_path,
            });
        }

        Ok(report)
    }

    /// Copy `Gemfile.lock` and `.bundle/` into the installed root gem.
    ///
    /// Returns the gem directory copied into, or `None` when the bundle
    /// already is the installed gem.
    ///
    /// # Errors
    ///
    /// Returns an error if the gem is not installed or a copy fails.
    pub fn copy_bundle_env(&self) -> Result<Option<PathBuf>, AppError> {
        let gem_dir = self.installed_spec()?.gem_dir;
        if same_dir(&gem_dir, &self.bundle_path) {
            debug!(dir = %gem_dir.display(), "bundle is the installed gem, nothing to copy");
            return Ok(None);
        }

        let from = self.lockfile_path();
        let to = gem_dir.join(LOCK_FILE);
        fs::create_dir_all(&gem_dir)
            .and_then(|()| fs::copy(&from, &to))
            .map_err(|source| AppError::Copy {
                from: from.clone(),
                to: to.clone(),
                source,
            })?;
        set_mode(&to, 0o644)?;
        info!(from = %from.display(), to = %to.display(), "copied lockfile");

        let bundle_config = self.bundle_path.join(BUNDLE_CONFIG_DIR);
        if bundle_config.is_dir() {
            let to = gem_dir.join(BUNDLE_CONFIG_DIR);
            copy_dir_all(&bundle_config, &to).map_err(|source| AppError::Copy {
                from: bundle_config.clone(),
                to: to.clone(),
                source,
            })?;
            info!(from = %bundle_config.display(), to = %to.display(), "copied bundle config");
        }

        Ok(Some(gem_dir))
    }
}

/// True if `path` exists and `generated` does not recognize its content.
fn is_foreign(path: &Path, generated: fn(&str) -> bool) -> bool {
    match fs::read(path) {
        Ok(bytes) => !generated(&String::from_utf8_lossy(&bytes)),
        Err(_) => path.exists(),
    }
}

fn is_binstub(content: &str) -> bool {
    BinstubHeader::detect(content).is_some()
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), StubError> {
    fs::write(path, content).map_err(|source| StubError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StubError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| StubError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StubError> {
    Ok(())
}

/// Recursively copy a directory, leaving the copy readable by everyone
/// (`chmod -R ugo+rX`).
fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else {
            // Permission bits come along with the copy.
            fs::copy(&src_path, &dst_path)?;
            make_world_readable(&dst_path)?;
        }
    }

    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;
    make_world_readable(dst)
}

/// Add read for all, and search/execute for all on directories and on
/// files that are already executable by someone.
#[cfg(unix)]
fn make_world_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)?;
    let mode = metadata.permissions().mode();
    let mut readable = mode | 0o444;
    if metadata.is_dir() || mode & 0o111 != 0 {
        readable |= 0o111;
    }
    if readable != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(readable))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_world_readable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
