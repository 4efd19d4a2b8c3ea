//! ArchCI - continuous integration for Arch Linux packages
//!
//! The `archci` command drives package builds from a descriptor checkout.
//!
//! ## Commands
//!
//! - `srcinfo`: Show the metadata of a package base
//! - `resolve`: Locate a dependency artifact in the publish tree
//! - `plan`: Print the build pipeline without running it
//! - `build`: Build, sign and publish a package base
//! - `poll`: Watch a git repository and record new commits
//! - `whoami` / `login-url`: Identity provider helpers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use archci_core::artifact::repo_arch;
use archci_core::config::CONFIG_ENV;
use archci_core::srcinfo::{descriptor_dir, load_or_generate};
use archci_core::{
    find_artifact, ChangeExtractor, ChangeRecord, Config, ExtractorConfig, GitCli, LogNotifier,
    Notifier, OpenIdClient, PackageMetadata, SendmailNotifier, VcsBackend,
};
use archci_pipeline::{
    assemble, describe, plan_digest, seed_properties, BuildEnvironment, BuildLocks,
    BuildProperties, BuildRequest, Channel, CommandExecutor, PipelineOptions, PipelineRunner,
    ProcessExecutor, Step, StepRunner,
};
use archci_state::{JsonFileCursorStore, JsonLinesChangeStore};

#[derive(Parser)]
#[command(name = "archci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuous integration for Arch Linux packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// A package base inside the descriptor checkout.
#[derive(Args, Debug, Clone)]
struct PackageArgs {
    /// Descriptor group (e.g. core, extra, community)
    #[arg(short, long)]
    group: String,

    /// Package base name
    pkg_base: String,
}

#[derive(Args, Debug, Clone, Default)]
struct BuildArgs {
    /// Build for the testing channel
    #[arg(long, conflicts_with = "staging")]
    testing: bool,

    /// Build for the staging channel
    #[arg(long)]
    staging: bool,

    /// Increment pkgrel before building
    #[arg(long)]
    bump_rel: bool,

    /// Override pkgver (resets pkgrel to 1 unless --pkgrel is given)
    #[arg(long)]
    pkgver: Option<String>,

    /// Override pkgrel
    #[arg(long)]
    pkgrel: Option<String>,

    /// Pin a commit-pinned VCS source to this revision
    #[arg(long)]
    revision: Option<String>,

    /// Pin a tag-pinned VCS source to this tag
    #[arg(long)]
    tag: Option<String>,

    /// Build only; skip upload, signing, repo-add and mirroring
    #[arg(long)]
    no_publish: bool,

    /// Leave the descriptor untouched (no bump, pin or write-back)
    #[arg(long)]
    keep_descriptor: bool,
}

impl BuildArgs {
    fn request(&self) -> BuildRequest {
        let channel = if self.testing {
            Channel::Testing
        } else if self.staging {
            Channel::Staging
        } else {
            Channel::Stable
        };
        BuildRequest {
            channel,
            bump_rel: self.bump_rel,
            version_override: self.pkgver.clone(),
            release_override: self.pkgrel.clone(),
            revision: self.revision.clone(),
            tag: self.tag.clone(),
        }
    }

    fn options(&self, config: &Config, pkg_base: &str) -> PipelineOptions {
        PipelineOptions {
            publish: !self.no_publish,
            mutate_descriptor: !self.keep_descriptor,
            ..PipelineOptions::from_config(config, pkg_base)
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the .SRCINFO metadata of a package base (generated if missing)
    Srcinfo {
        #[command(flatten)]
        package: PackageArgs,
    },

    /// Find the published artifact of a dependency
    Resolve {
        /// Package name prefix
        name: String,

        /// Package architecture (`any` resolves under x86_64)
        #[arg(long, default_value = "x86_64")]
        arch: String,
    },

    /// Print the build pipeline of a package base without running it
    Plan {
        #[command(flatten)]
        package: PackageArgs,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Build a package base in a clean chroot and publish it
    Build {
        #[command(flatten)]
        package: PackageArgs,

        #[command(flatten)]
        build: BuildArgs,

        /// Kill any single step running longer than this
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Watch the configured git repository for new commits
    Poll {
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },

    /// Show the profile behind an access token
    Whoami {
        /// Bearer token issued by the identity provider
        #[arg(long, env = "ARCHCI_ACCESS_TOKEN")]
        token: String,
    },

    /// Print the identity provider's authorization URL
    LoginUrl {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        redirect_uri: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    archci_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Srcinfo { package } => cmd_srcinfo(&config, &package, cli.json).await,
        Commands::Resolve { name, arch } => cmd_resolve(&config, &name, &arch, cli.json),
        Commands::Plan { package, build } => cmd_plan(&config, &package, &build, cli.json).await,
        Commands::Build {
            package,
            build,
            timeout_secs,
        } => cmd_build(&config, &package, &build, timeout_secs, cli.json).await,
        Commands::Poll { once } => cmd_poll(&config, once, cli.json).await,
        Commands::Whoami { token } => cmd_whoami(&config, &token, cli.json).await,
        Commands::LoginUrl {
            client_id,
            redirect_uri,
        } => cmd_login_url(&config, &client_id, &redirect_uri).await,
    }
}

/// Read `path`, or fall back to built-in defaults when no file is given.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_package(config: &Config, package: &PackageArgs) -> Result<(PathBuf, PackageMetadata)> {
    let dir = descriptor_dir(
        &config.repository.descriptor_root,
        &package.group,
        &package.pkg_base,
    );
    let meta = load_or_generate(&dir, &config.build.srcinfo_generator())
        .await
        .with_context(|| format!("Failed to read metadata from {}", dir.display()))?;
    Ok((dir, meta))
}

async fn cmd_srcinfo(config: &Config, package: &PackageArgs, json: bool) -> Result<()> {
    let (dir, meta) = load_package(config, package).await?;
    if json {
        return print_json(&meta);
    }

    println!("Descriptor: {}", dir.display());
    println!("Version:    {}", meta.full_version());
    println!("Arch:       {}", meta.arch);
    println!("Packages:   {}", meta.pkg_names.join(" "));
    if !meta.source_entries.is_empty() {
        println!("Sources:    {}", meta.source_entries.join(" "));
    }
    if let Some(install) = &meta.install {
        println!("Install:    {install}");
    }
    if let Some(vcs) = &meta.vcs {
        let pin = match (vcs.pin_mode, vcs.pin_value.as_deref()) {
            (Some(mode), Some(value)) => format!(" ({}={value})", mode.as_str()),
            _ => String::new(),
        };
        println!("VCS:        {} {}{pin}", vcs.kind.as_str(), vcs.url);
    }
    Ok(())
}

fn cmd_resolve(config: &Config, name: &str, arch: &str, json: bool) -> Result<()> {
    config.validate()?;
    let repo = &config.repository;
    let search_root = repo
        .root
        .join(format!("{}-{}", repo.name, repo.suffix))
        .join(repo_arch(arch));
    let artifact = find_artifact(&search_root, name, repo.package_ext.as_str())?;
    if json {
        print_json(&artifact)
    } else {
        println!("{}={}", artifact.property_key(), artifact.path.display());
        Ok(())
    }
}

async fn prepare(
    config: &Config,
    package: &PackageArgs,
    build: &BuildArgs,
) -> Result<(Vec<Step>, BuildProperties)> {
    config.validate()?;
    let (dir, meta) = load_package(config, package).await?;
    let env = BuildEnvironment::from_config(config, dir, &package.pkg_base);
    let request = build.request();
    let options = build.options(config, &package.pkg_base);
    let steps = assemble(&meta, &env, &request, &options);
    let preview = seed_properties(&meta, &env, &request, &options);
    Ok((steps, preview))
}

async fn cmd_plan(config: &Config, package: &PackageArgs, build: &BuildArgs, json: bool) -> Result<()> {
    let (steps, preview) = prepare(config, package, build).await?;
    if json {
        return print_json(&serde_json::json!({
            "plan_digest": plan_digest(&steps),
            "steps": steps,
        }));
    }

    for (i, line) in describe(&steps, &preview).iter().enumerate() {
        println!("{:>3}. {line}", i + 1);
    }
    println!("Plan digest: {}", plan_digest(&steps));
    Ok(())
}

async fn cmd_build(
    config: &Config,
    package: &PackageArgs,
    build: &BuildArgs,
    timeout_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let (steps, _) = prepare(config, package, build).await?;
    let executor: Arc<dyn CommandExecutor> = Arc::new(match timeout_secs {
        Some(secs) => ProcessExecutor::with_timeout(Duration::from_secs(secs)),
        None => ProcessExecutor::new(),
    });
    let runner = PipelineRunner::new(
        StepRunner::new(executor),
        BuildLocks::new(config.build.lock_slots),
    );

    info!(pkg_base = %package.pkg_base, steps = steps.len(), "starting build");
    let mut props = BuildProperties::new();
    let result = runner.run(&steps, &mut props).await;

    if json {
        print_json(&result)?;
    } else {
        for step in &result.steps {
            println!(
                "  {:<8} {} ({}ms)",
                step.outcome.as_str(),
                step.step_name,
                step.duration_ms
            );
        }
        println!(
            "Run {}: {} passed, {} failed, {} skipped in {}ms",
            result.run_id,
            result.passed_count(),
            result.failed_count(),
            result.skipped_count(),
            result.duration_ms
        );
    }

    if let Some(failure) = result.first_failure() {
        if !json {
            eprintln!("{}", failure.stderr.trim_end());
        }
        bail!(
            "build of {} failed at step '{}'",
            package.pkg_base,
            failure.step_name
        );
    }
    Ok(())
}

fn extractor_config(config: &Config) -> ExtractorConfig {
    let poller = &config.poller;
    let repo_url = if poller.repo_url.is_empty() {
        poller.repo_dir.display().to_string()
    } else {
        poller.repo_url.clone()
    };
    ExtractorConfig {
        project: poller.project.clone(),
        category: poller.category.clone(),
        build_pushes_with_no_commits: poller.build_pushes_with_no_commits,
        fetch_committer: poller.fetch_committer,
        notify_on_release: config.notify.enabled,
        ..ExtractorConfig::new(repo_url)
    }
}

fn notifier(config: &Config) -> Arc<dyn Notifier> {
    let notify = &config.notify;
    if notify.enabled && !notify.recipients.is_empty() {
        Arc::new(SendmailNotifier::new(
            notify.program.clone(),
            notify.sender.clone(),
            notify.recipients.clone(),
        ))
    } else {
        Arc::new(LogNotifier)
    }
}

async fn poll_once(
    git: &GitCli,
    config: &Config,
    extractor: &mut ChangeExtractor,
) -> Result<Vec<ChangeRecord>> {
    let poller = &config.poller;
    git.fetch(&poller.remote)
        .await
        .with_context(|| format!("Failed to fetch {}", poller.remote))?;

    let mut heads = Vec::with_capacity(poller.branches.len());
    for branch in &poller.branches {
        let rev = git
            .resolve_ref(&format!("{}/{branch}", poller.remote))
            .await
            .with_context(|| format!("Failed to resolve branch {branch}"))?;
        heads.push((branch.clone(), rev));
    }
    Ok(extractor.poll(&heads).await?)
}

async fn cmd_poll(config: &Config, once: bool, json: bool) -> Result<()> {
    let poller = &config.poller;
    let git = Arc::new(GitCli::new(&poller.repo_dir));
    let vcs: Arc<dyn VcsBackend> = git.clone();
    let mut extractor = ChangeExtractor::load(
        extractor_config(config),
        vcs,
        Arc::new(JsonLinesChangeStore::new(&poller.changes_file)),
        notifier(config),
        Arc::new(JsonFileCursorStore::new(&poller.state_file)),
    )
    .await
    .context("Failed to restore poll state")?;

    loop {
        match poll_once(&git, config, &mut extractor).await {
            Ok(changes) => {
                for change in &changes {
                    if json {
                        println!("{}", serde_json::to_string(change)?);
                    } else {
                        println!(
                            "{} {} {} [{}]",
                            &change.revision[..change.revision.len().min(12)],
                            change.branch,
                            change.author,
                            change.tag.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            Err(e) if once => return Err(e),
            Err(e) => warn!(error = %format!("{e:#}"), "poll failed"),
        }
        if once {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(poller.interval_secs)).await;
    }
}

async fn identity_client(config: &Config) -> Result<OpenIdClient> {
    let uri = config
        .identity
        .configuration_uri
        .as_deref()
        .context("identity.configuration_uri is not set")?;
    OpenIdClient::discover(uri)
        .await
        .with_context(|| format!("Failed to discover identity provider at {uri}"))
}

async fn cmd_whoami(config: &Config, token: &str, json: bool) -> Result<()> {
    let profile = identity_client(config).await?.user_info(token).await?;
    if json {
        print_json(&profile)
    } else {
        println!("{} <{}> ({})", profile.full_name, profile.email, profile.username);
        Ok(())
    }
}

async fn cmd_login_url(config: &Config, client_id: &str, redirect_uri: &str) -> Result<()> {
    let url = identity_client(config)
        .await?
        .authorization_url(client_id, redirect_uri)?;
    println!("{url}");
    Ok(())
}
