use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use bundlekit_core::{
    default_config_path, ArtifactClass, OutcomeKind, UpdateConfig, VersionRequirement,
};
use bundlekit_fetch::{build_http_client, FetchClient, RetryPolicy};
use bundlekit_installer::{InstallLayout, InstallRecord, InstallState, InstallStateStore};
use bundlekit_resolver::Updater;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, describe_failure, describe_outcome, DownloadProgress, OutputStyle,
    TerminalRenderer,
};
use crate::{Cli, Commands};

pub(crate) const EXIT_OK: u8 = 0;
pub(crate) const EXIT_INSTALL_FAILED: u8 = 1;
pub(crate) const EXIT_FETCH_FAILED: u8 = 10;
pub(crate) const EXIT_VERIFY_FAILED: u8 = 11;
pub(crate) const EXIT_LOCK_TIMEOUT: u8 = 12;
pub(crate) const EXIT_MANIFEST_UNAVAILABLE: u8 = 13;
pub(crate) const EXIT_DISK_FULL: u8 = 14;

pub(crate) fn exit_code(kind: OutcomeKind) -> u8 {
    match kind {
        OutcomeKind::AlreadyCurrent | OutcomeKind::UpdatedByFetch | OutcomeKind::UpdatedByPatch => {
            EXIT_OK
        }
        OutcomeKind::FetchFailed => EXIT_FETCH_FAILED,
        OutcomeKind::VerifyFailed => EXIT_VERIFY_FAILED,
        OutcomeKind::LockTimeout => EXIT_LOCK_TIMEOUT,
        OutcomeKind::ManifestUnavailable => EXIT_MANIFEST_UNAVAILABLE,
        OutcomeKind::DiskFull => EXIT_DISK_FULL,
        OutcomeKind::InstallFailed => EXIT_INSTALL_FAILED,
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let style = current_output_style();

    match cli.command {
        Commands::Ensure {
            class,
            version,
            lock_timeout,
        } => {
            let mut config = load_config(cli.config.as_deref(), env_lookup)?;
            if let Some(secs) = lock_timeout {
                config.lock_timeout_secs = Some(secs);
            }
            let requirement = match version {
                Some(version) => VersionRequirement::parse(&version)?,
                None => VersionRequirement::Latest,
            };
            let layout = InstallLayout::from_config(&config, env_lookup)?;
            let code = run_ensure(config, layout, class, &requirement, style)?;
            Ok(ExitCode::from(code))
        }
        Commands::Status { class } => {
            let config = load_config(cli.config.as_deref(), env_lookup)?;
            let layout = InstallLayout::from_config(&config, env_lookup)?;
            let store = InstallStateStore::new(&layout);
            let renderer = TerminalRenderer::from_style(style);
            let classes = match class {
                Some(class) => vec![class],
                None => ArtifactClass::ALL.to_vec(),
            };
            for class in classes {
                let record = store.load(class)?;
                renderer.print_section(class.as_str());
                renderer.print_lines(&format_status_lines(&record));
            }
            Ok(ExitCode::from(EXIT_OK))
        }
        Commands::Paths => {
            let config = load_config(cli.config.as_deref(), env_lookup)?;
            let layout = InstallLayout::from_config(&config, env_lookup)?;
            let config_path = match cli.config {
                Some(path) => path,
                None => default_config_path(env_lookup)?,
            };
            TerminalRenderer::from_style(style)
                .print_lines(&format_path_lines(&config_path, &layout));
            Ok(ExitCode::from(EXIT_OK))
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
            Ok(ExitCode::from(EXIT_OK))
        }
    }
}

pub(crate) fn load_config<F>(explicit: Option<&Path>, lookup: F) -> Result<UpdateConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => default_config_path(&lookup)?,
    };
    debug!(path = %path.display(), "loading config");
    let mut config = UpdateConfig::load(&path)?;
    config.apply_env_overrides(&lookup)?;
    Ok(config)
}

pub(crate) fn run_ensure(
    config: UpdateConfig,
    layout: InstallLayout,
    class: ArtifactClass,
    requirement: &VersionRequirement,
    style: OutputStyle,
) -> Result<u8> {
    let client = build_http_client(&config.network)?;
    let mut fetch = FetchClient::new(client, RetryPolicy::from_config(&config.network));
    if style == OutputStyle::Rich {
        fetch = fetch.with_observer(Arc::new(DownloadProgress::new()));
    }

    let updater = Updater::new(config, layout, fetch);
    let renderer = TerminalRenderer::from_style(style);
    match updater.ensure(class, requirement) {
        Ok(outcome) => {
            renderer.print_status("ok", &describe_outcome(&outcome));
            println!("{}", outcome.artifact().install_path.display());
            Ok(exit_code(outcome.kind()))
        }
        Err(err) => {
            renderer.print_status("error", &describe_failure(class, &err));
            Ok(exit_code(err.kind()))
        }
    }
}

pub(crate) fn format_status_lines(record: &InstallRecord) -> Vec<String> {
    let mut lines = Vec::new();
    match (&record.installed, record.state) {
        (Some(installed), InstallState::Installed) => {
            lines.push(format!(
                "{}: {} ({}) at {}",
                record.class,
                installed.version,
                installed.source.as_str(),
                installed.install_path.display()
            ));
            lines.push(format!("  content_sha256={}", installed.content_sha256));
        }
        (installed, state) => {
            let version = installed
                .as_ref()
                .map(|installed| format!(" (previous {})", installed.version))
                .unwrap_or_default();
            lines.push(format!("{}: {}{version}", record.class, state.as_str()));
        }
    }
    if record.state == InstallState::Installing {
        match &record.marker {
            Some(marker) => lines.push(format!(
                "  interrupted update to {} (txid={} pid={})",
                marker.target, marker.txid, marker.pid
            )),
            None => lines.push("  interrupted update (unreadable marker)".to_string()),
        }
    }
    lines
}

pub(crate) fn format_path_lines(config_path: &Path, layout: &InstallLayout) -> Vec<String> {
    let mut lines = vec![
        format!("config: {}", config_path.display()),
        format!("data: {}", layout.data_root().display()),
        format!("cache: {}", layout.cache_root().display()),
        format!("manifest-cache: {}", layout.manifest_cache_path().display()),
    ];
    for class in ArtifactClass::ALL {
        lines.push(format!("{class}: {}", layout.install_path(class).display()));
    }
    lines
}
