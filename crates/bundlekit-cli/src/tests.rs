use std::fs;
use std::path::PathBuf;

use bundlekit_core::{
    ArtifactClass, ArtifactVersion, NetworkConfig, OutcomeKind, UpdateConfig, UpdateError,
    VersionRequirement,
};
use bundlekit_fetch::ProgressObserver;
use bundlekit_installer::{
    InstallLayout, InstallMarker, InstallRecord, InstallSource, InstallState, InstalledArtifact,
};
use bundlekit_resolver::{ResolvedArtifact, UpdateOutcome};
use clap::error::ErrorKind;
use clap::Parser;
use httptest::{matchers::*, responders::*, Expectation, Server};

use super::*;
use crate::completion::write_completions_script;
use crate::dispatch::{
    exit_code, format_path_lines, format_status_lines, load_config, run_ensure, EXIT_DISK_FULL,
    EXIT_FETCH_FAILED, EXIT_INSTALL_FAILED, EXIT_LOCK_TIMEOUT, EXIT_MANIFEST_UNAVAILABLE,
    EXIT_OK, EXIT_VERIFY_FAILED,
};
use crate::render::{
    describe_failure, describe_outcome, progress_label, render_status_line, DownloadProgress,
    OutputStyle,
};

fn version(value: &str) -> ArtifactVersion {
    ArtifactVersion::new(value).expect("must parse version")
}

fn resolved(version_str: &str) -> ResolvedArtifact {
    ResolvedArtifact {
        class: ArtifactClass::RuntimeImage,
        version: version(version_str),
        install_path: PathBuf::from("/data/artifacts/runtime-image"),
        content_sha256: "a".repeat(64),
    }
}

fn installed_artifact() -> InstalledArtifact {
    InstalledArtifact {
        class: ArtifactClass::RuntimeImage,
        version: version("1.2.0"),
        archive_sha256: "b".repeat(64),
        content_sha256: "c".repeat(64),
        install_path: PathBuf::from("/data/artifacts/runtime-image"),
        store_path: PathBuf::from("/data/artifacts/.store/runtime-image-1.2.0-tx1"),
        installed_at_unix: 1_771_001_234,
        source: InstallSource::Patch,
    }
}

#[test]
fn ensure_parses_class_alias_version_and_lock_timeout() {
    let cli = Cli::try_parse_from([
        "bundlekit",
        "ensure",
        "runtime",
        "--version",
        "1.2.3",
        "--lock-timeout",
        "5",
    ])
    .expect("must parse ensure");

    match cli.command {
        Commands::Ensure {
            class,
            version,
            lock_timeout,
        } => {
            assert_eq!(class, ArtifactClass::RuntimeImage);
            assert_eq!(version.as_deref(), Some("1.2.3"));
            assert_eq!(lock_timeout, Some(5));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn unknown_class_is_rejected_with_known_names() {
    let err = Cli::try_parse_from(["bundlekit", "ensure", "steam"])
        .expect_err("must reject unknown class");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
    let rendered = err.to_string();
    assert!(rendered.contains("runtime-image"));
    assert!(rendered.contains("compat-layer"));
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "bundlekit",
        "status",
        "compat-layer",
        "-vv",
        "--config",
        "/tmp/bk.toml",
    ])
    .expect("must parse status");
    assert_eq!(cli.verbose, 2);
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/bk.toml")));
    assert!(matches!(
        cli.command,
        Commands::Status {
            class: Some(ArtifactClass::CompatLayer)
        }
    ));
}

#[test]
fn log_directive_follows_verbosity() {
    assert_eq!(log_directive(0), "info");
    assert_eq!(log_directive(1), "debug");
    assert_eq!(log_directive(5), "trace");
}

#[test]
fn exit_codes_are_distinct_per_failure_kind() {
    assert_eq!(exit_code(OutcomeKind::AlreadyCurrent), EXIT_OK);
    assert_eq!(exit_code(OutcomeKind::UpdatedByFetch), EXIT_OK);
    assert_eq!(exit_code(OutcomeKind::UpdatedByPatch), EXIT_OK);
    assert_eq!(exit_code(OutcomeKind::FetchFailed), 10);
    assert_eq!(exit_code(OutcomeKind::VerifyFailed), 11);
    assert_eq!(exit_code(OutcomeKind::LockTimeout), 12);
    assert_eq!(exit_code(OutcomeKind::ManifestUnavailable), 13);
    assert_eq!(exit_code(OutcomeKind::DiskFull), 14);
    assert_eq!(exit_code(OutcomeKind::InstallFailed), 1);

    let mut codes = vec![
        EXIT_OK,
        EXIT_INSTALL_FAILED,
        EXIT_FETCH_FAILED,
        EXIT_VERIFY_FAILED,
        EXIT_LOCK_TIMEOUT,
        EXIT_MANIFEST_UNAVAILABLE,
        EXIT_DISK_FULL,
    ];
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), 7);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "runtime-image 1.0.0 is up to date"),
        "runtime-image 1.0.0 is up to date"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "error", "could not download runtime-image"),
        "[ERROR] could not download runtime-image"
    );
}

#[test]
fn each_outcome_has_its_own_message() {
    assert_eq!(
        describe_outcome(&UpdateOutcome::AlreadyCurrent(resolved("1.0.0"))),
        "runtime-image 1.0.0 is up to date"
    );
    assert_eq!(
        describe_outcome(&UpdateOutcome::UpdatedByFetch(resolved("2.0.0"))),
        "updated runtime-image to 2.0.0 (full download)"
    );
    assert_eq!(
        describe_outcome(&UpdateOutcome::UpdatedByPatch(resolved("2.0.0"))),
        "updated runtime-image to 2.0.0 (patch)"
    );
}

#[test]
fn failure_messages_name_the_situation() {
    let lock = describe_failure(
        ArtifactClass::CompatLayer,
        &UpdateError::LockTimeout {
            class: ArtifactClass::CompatLayer,
            waited: std::time::Duration::from_secs(3),
        },
    );
    assert!(lock.starts_with("another instance is still updating compat-layer"));

    let network = describe_failure(
        ArtifactClass::RuntimeImage,
        &UpdateError::Network {
            url: "https://repo.example/runtime.tar.gz".to_string(),
            message: "connection refused".to_string(),
        },
    );
    assert!(network.starts_with("could not download runtime-image"));
    assert!(network.contains("could not reach the server"));

    let verify = describe_failure(
        ArtifactClass::RuntimeImage,
        &UpdateError::ChecksumMismatch {
            path: PathBuf::from("/cache/runtime.tar.gz"),
            expected: "a".repeat(64),
            actual: "b".repeat(64),
        },
    );
    assert!(verify.contains("failed verification"));
}

#[test]
fn unpublished_version_is_not_reported_as_missing_install() {
    let message = describe_failure(
        ArtifactClass::RuntimeImage,
        &UpdateError::UnknownVersion {
            class: ArtifactClass::RuntimeImage,
            version: version("9.9.9"),
        },
    );
    assert!(message.starts_with("runtime-image 9.9.9 is not available from the server"));
    assert!(!message.contains("no usable"));

    let unavailable = describe_failure(
        ArtifactClass::RuntimeImage,
        &UpdateError::ManifestUnavailable {
            reason: "HTTP 503".to_string(),
        },
    );
    assert!(unavailable.starts_with("no usable runtime-image is installed"));
}

#[test]
fn status_lines_for_installed_artifact() {
    let record = InstallRecord {
        class: ArtifactClass::RuntimeImage,
        state: InstallState::Installed,
        installed: Some(installed_artifact()),
        marker: None,
    };
    let lines = format_status_lines(&record);
    assert_eq!(
        lines,
        vec![
            "runtime-image: 1.2.0 (patch) at /data/artifacts/runtime-image".to_string(),
            format!("  content_sha256={}", "c".repeat(64)),
        ]
    );
}

#[test]
fn status_lines_report_interrupted_update() {
    let record = InstallRecord {
        class: ArtifactClass::RuntimeImage,
        state: InstallState::Installing,
        installed: Some(installed_artifact()),
        marker: Some(InstallMarker {
            target: version("1.3.0"),
            txid: "tx2".to_string(),
            pid: 4242,
            started_at_unix: 1_771_001_300,
        }),
    };
    let lines = format_status_lines(&record);
    assert_eq!(lines[0], "runtime-image: installing (previous 1.2.0)");
    assert_eq!(lines[1], "  interrupted update to 1.3.0 (txid=tx2 pid=4242)");
}

#[test]
fn status_lines_for_absent_artifact() {
    let record = InstallRecord {
        class: ArtifactClass::CompatLayer,
        state: InstallState::Absent,
        installed: None,
        marker: None,
    };
    assert_eq!(format_status_lines(&record), vec!["compat-layer: absent".to_string()]);
}

#[test]
fn path_lines_list_roots_and_install_paths() {
    let layout = InstallLayout::new("/data/bundlekit", "/cache/bundlekit");
    let lines = format_path_lines(&PathBuf::from("/etc/bk.toml"), &layout);
    assert_eq!(lines[0], "config: /etc/bk.toml");
    assert_eq!(lines[1], "data: /data/bundlekit");
    assert_eq!(lines[2], "cache: /cache/bundlekit");
    let runtime_path = layout
        .install_path(ArtifactClass::RuntimeImage)
        .display()
        .to_string();
    assert!(lines.contains(&format!("runtime-image: {runtime_path}")));
    assert!(lines.iter().any(|line| line.starts_with("compat-layer: ")));
}

#[test]
fn completions_script_names_binary() {
    let mut out = Vec::new();
    write_completions_script(clap_complete::Shell::Bash, &mut out)
        .expect("must write completions");
    let script = String::from_utf8(out).expect("must be utf8");
    assert!(script.contains("bundlekit"));
    assert!(script.contains("ensure"));
}

#[test]
fn load_config_reads_file_then_applies_env_overrides() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "manifest_url = \"https://mirror.example/artifacts.toml\"\n[network]\nmax_attempts = 2\n",
    )
    .expect("must write config");

    let config = load_config(Some(&path), |key| match key {
        "BUNDLEKIT_UPDATES" => Some("0".to_string()),
        "BUNDLEKIT_LOCK_TIMEOUT" => Some("30".to_string()),
        _ => None,
    })
    .expect("must load config");

    assert_eq!(config.manifest_url, "https://mirror.example/artifacts.toml");
    assert_eq!(config.network.max_attempts, 2);
    assert!(!config.updates_enabled);
    assert_eq!(config.lock_timeout_secs, Some(30));
}

#[test]
fn load_config_uses_defaults_when_file_is_missing() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let xdg = dir.path().to_string_lossy().into_owned();
    let config = load_config(None, |key| match key {
        "XDG_CONFIG_HOME" => Some(xdg.clone()),
        _ => None,
    })
    .expect("must load defaults");
    assert_eq!(config, UpdateConfig::default());
}

#[test]
fn ensure_without_install_or_manifest_exits_manifest_unavailable() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/artifacts.toml"))
            .times(1..)
            .respond_with(status_code(503)),
    );

    let config = UpdateConfig {
        manifest_url: server.url_str("/artifacts.toml"),
        data_root: Some(dir.path().join("data")),
        cache_root: Some(dir.path().join("cache")),
        network: NetworkConfig {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..NetworkConfig::default()
        },
        ..UpdateConfig::default()
    };
    let layout = InstallLayout::from_config(&config, |_| None).expect("must build layout");

    let code = run_ensure(
        config,
        layout,
        ArtifactClass::RuntimeImage,
        &VersionRequirement::Latest,
        OutputStyle::Plain,
    )
    .expect("must run ensure");
    assert_eq!(code, EXIT_MANIFEST_UNAVAILABLE);
}

#[test]
fn progress_label_is_the_file_name() {
    assert_eq!(
        progress_label("https://repo.example/sniper/runtime.tar.gz?token=1"),
        "runtime.tar.gz"
    );
    assert_eq!(progress_label("https://repo.example/"), "https://repo.example/");
}

#[test]
fn download_progress_tolerates_unknown_totals_and_restarts() {
    let progress = DownloadProgress::new();
    progress.on_start("https://repo.example/a.tar.gz", 0, None);
    progress.on_progress(512);
    progress.on_start("https://repo.example/a.tar.gz", 1024, Some(4096));
    progress.on_progress(1024);
    progress.on_finish();
    progress.on_finish();
}
