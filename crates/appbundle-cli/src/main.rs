//! appbundle - binstubs that pin an application's locked gem versions

use anyhow::{Context, Result};
use appbundle_pkg::Config;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod generate;

/// Environment variable holding a `tracing` filter directive.
const LOG_ENV: &str = "APPBUNDLE_LOG";

#[derive(Parser, Debug)]
#[command(name = "appbundle")]
#[command(version)]
#[command(
    about = "Generate binstubs that load an application with the exact gem versions of its Gemfile.lock",
    long_about = "Generate binstubs that load an application with the exact gem versions of its \
Gemfile.lock.\n\nThe application must already be installed as a gem. Generated binstubs point \
to the installed gem, not to the working copy in BUNDLE_DIR."
)]
struct Cli {
    /// Root directory of the bundle containing your app
    bundle_dir: PathBuf,

    /// Directory where generated executables are written
    binstub_dir: PathBuf,

    /// Gems to appbundle (defaults to the name of BUNDLE_DIR, e.g. /src/chef -> chef)
    gems: Vec<String>,

    /// Ruby interpreter written into shebangs (defaults to the first ruby on PATH)
    #[arg(long, value_name = "PATH", env = "APPBUNDLE_RUBY")]
    ruby: Option<PathBuf>,

    /// Gem directory to search for installed gems (repeatable, defaults to GEM_HOME and GEM_PATH)
    #[arg(long = "gem-path", value_name = "DIR")]
    gem_path: Vec<PathBuf>,

    /// Write .bat wrappers next to each binstub
    #[arg(long, overrides_with = "no_windows")]
    windows: bool,

    /// Never write .bat wrappers
    #[arg(long = "no-windows", overrides_with = "windows")]
    no_windows: bool,

    /// Overwrite existing files that were not generated by appbundle
    #[arg(long)]
    force: bool,

    /// Do not copy Gemfile.lock and .bundle/ into the installed gem
    #[arg(long = "no-copy-env")]
    no_copy_env: bool,

    /// Configuration file (defaults to BUNDLE_DIR/appbundle.toml if present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// `Some` when a wrapper flag was given.
    fn windows_wrappers(&self) -> Option<bool> {
        if self.windows {
            Some(true)
        } else if self.no_windows {
            Some(false)
        } else {
            None
        }
    }

    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::from_path(path)
                .with_context(|| format!("failed to load config '{}'", path.display())),
            None => Config::discover(&self.bundle_dir).context("failed to load appbundle.toml"),
        }
    }

    /// Merge flags over the configuration file over the defaults.
    fn into_options(self, config: Config) -> Result<generate::GenerateOptions> {
        let windows_wrappers = self
            .windows_wrappers()
            .or(config.windows_wrappers)
            .unwrap_or(cfg!(windows));
        let copy_bundle_env = !self.no_copy_env && config.copy_bundle_env.unwrap_or(true);

        let ruby = match self.ruby.or(config.ruby) {
            Some(ruby) => ruby,
            None => find_ruby()?,
        };
        let gems = if self.gems.is_empty() { config.apps } else { self.gems };
        let gem_path = if self.gem_path.is_empty() {
            config.gem_path
        } else {
            self.gem_path
        };

        Ok(generate::GenerateOptions {
            bundle_dir: self.bundle_dir,
            binstub_dir: self.binstub_dir,
            gems,
            ruby,
            gem_path,
            windows_wrappers,
            force: self.force,
            copy_bundle_env,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    let options = cli.into_options(config)?;
    let result = generate::generate(&options)?;
    result.print_summary();
    Ok(())
}

fn setup_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// The first `ruby` executable on `PATH`.
fn find_ruby() -> Result<PathBuf> {
    let path = std::env::var_os("PATH").context("PATH is not set, pass --ruby")?;
    find_in_path("ruby", &path).context("no ruby found on PATH, pass --ruby")
}

fn find_in_path(program: &str, path: &std::ffi::OsStr) -> Option<PathBuf> {
    let names = if cfg!(windows) {
        vec![format!("{program}.exe"), program.to_string()]
    } else {
        vec![program.to_string()]
    };

    std::env::split_paths(path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("appbundle").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_positionals() {
        let cli = parse(&["/src/chef", "/opt/chef/bin", "chef", "ohai"]);

        assert_eq!(cli.bundle_dir, PathBuf::from("/src/chef"));
        assert_eq!(cli.binstub_dir, PathBuf::from("/opt/chef/bin"));
        assert_eq!(cli.gems, vec!["chef", "ohai"]);
        assert_eq!(cli.windows_wrappers(), None);
    }

    #[test]
    fn test_requires_two_directories() {
        assert!(Cli::try_parse_from(["appbundle", "/src/chef"]).is_err());
    }

    #[test]
    fn test_windows_flags_override_each_other() {
        assert_eq!(parse(&["a", "b", "--windows"]).windows_wrappers(), Some(true));
        assert_eq!(parse(&["a", "b", "--no-windows"]).windows_wrappers(), Some(false));
        assert_eq!(
            parse(&["a", "b", "--windows", "--no-windows"]).windows_wrappers(),
            Some(false)
        );
    }

    #[test]
    fn test_verbosity_count() {
        assert_eq!(parse(&["a", "b", "-vv"]).verbose, 2);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "/src/chef",
            "/opt/chef/bin",
            "--ruby",
            "/opt/chef/embedded/bin/ruby",
            "--gem-path",
            "/opt/gems",
            "--no-windows",
            "--no-copy-env",
        ]);
        let config = Config {
            ruby: Some(PathBuf::from("/usr/bin/ruby")),
            gem_path: vec![PathBuf::from("/var/gems")],
            apps: vec!["chef".to_string(), "ohai".to_string()],
            windows_wrappers: Some(true),
            copy_bundle_env: Some(true),
        };

        let options = cli.into_options(config).unwrap();
        assert_eq!(options.ruby, PathBuf::from("/opt/chef/embedded/bin/ruby"));
        assert_eq!(options.gem_path, vec![PathBuf::from("/opt/gems")]);
        assert_eq!(options.gems, vec!["chef", "ohai"]);
        assert!(!options.windows_wrappers);
        assert!(!options.copy_bundle_env);
    }

    #[test]
    fn test_config_fills_defaults() {
        let cli = parse(&["/src/chef", "/opt/chef/bin", "--ruby", "/usr/bin/ruby"]);
        let config = Config {
            windows_wrappers: Some(true),
            ..Config::default()
        };

        let options = cli.into_options(config).unwrap();
        assert!(options.windows_wrappers);
        assert!(options.copy_bundle_env);
        assert!(options.gems.is_empty());
    }

    #[test]
    fn test_find_in_path() {
        let tmp = TempDir::new().unwrap();
        let ruby = tmp.path().join(if cfg!(windows) { "ruby.exe" } else { "ruby" });
        std::fs::write(&ruby, "").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&ruby, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let path = std::env::join_paths([PathBuf::from("/nonexistent"), tmp.path().to_path_buf()])
            .unwrap();
        assert_eq!(find_in_path("ruby", &path), Some(ruby));
        assert_eq!(find_in_path("jruby", &path), None);
    }
}
