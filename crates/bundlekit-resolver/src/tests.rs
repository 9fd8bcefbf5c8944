use std::fs;
use std::path::Path;
use std::thread;

use bundlekit_core::{
    ArtifactClass, ArtifactVersion, Manifest, NetworkConfig, OutcomeKind, UpdateConfig,
    UpdateError, VersionRequirement,
};
use bundlekit_installer::{
    ArtifactLock, AtomicInstaller, InstallLayout, InstallRecord, InstallState, InstallStateStore,
};
use bundlekit_patch::{
    compress_contents, DeltaOp, EntryKind, PatchBlob, PatchContents, PatchHeader,
    PatchManifestEntry, UpdatedFile,
};
use bundlekit_security::{content_digest, scan_tree, sha256_hex, TreeEntryKind};
use flate2::write::GzEncoder;
use flate2::Compression;
use httptest::{matchers::*, responders::*, Expectation, Server};

use super::*;

const CLASS: ArtifactClass = ArtifactClass::RuntimeImage;

const V1_FILES: &[(&str, &str, u32)] = &[
    ("VERSION", "1.0.0\n", 0o644),
    ("bin/entry", "#!/bin/sh\n", 0o755),
];

const V2_FILES: &[(&str, &str, u32)] = &[
    ("VERSION", "2.0.0\n", 0o644),
    ("bin/entry", "#!/bin/sh\n", 0o755),
];

fn version(value: &str) -> ArtifactVersion {
    ArtifactVersion::new(value).expect("must parse version")
}

fn archive_bytes(files: &[(&str, &str, u32)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("bundle/{name}"), data.as_bytes())
            .expect("must append entry");
    }
    builder
        .into_inner()
        .expect("must finish tar")
        .finish()
        .expect("must finish gzip")
}

fn write_tree(root: &Path, files: &[(&str, &str, u32)]) {
    for (name, data, mode) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().expect("parent")).expect("must create dir");
        fs::write(&path, data).expect("must write file");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).expect("must set mode");
        }
        #[cfg(not(unix))]
        let _ = mode;
    }
}

fn tree_digest(scratch: &Path, name: &str, files: &[(&str, &str, u32)]) -> String {
    let root = scratch.join(name);
    write_tree(&root, files);
    content_digest(&root).expect("must digest tree")
}

struct Build {
    version: &'static str,
    archive: Vec<u8>,
    content_sha256: String,
}

impl Build {
    fn new(scratch: &Path, version: &'static str, files: &[(&str, &str, u32)]) -> Self {
        Self {
            version,
            archive: archive_bytes(files),
            content_sha256: tree_digest(scratch, &format!("tree-{version}"), files),
        }
    }

    fn path(&self) -> String {
        format!("/runtime-{}.tar.gz", self.version)
    }

    fn toml(&self, server: &Server) -> String {
        format!(
            "[artifacts.runtime-image]\nversion = \"{}\"\nurl = \"{}\"\nsha256 = \"{}\"\nsize = {}\ncontent_sha256 = \"{}\"\nstrip_components = 1\n",
            self.version,
            server.url_str(&self.path()),
            sha256_hex(&self.archive),
            self.archive.len(),
            self.content_sha256
        )
    }
}

fn patch_toml(server: &Server, base: &str, blob: &[u8]) -> String {
    format!(
        "\n[[artifacts.runtime-image.patches]]\nbase = \"{base}\"\nurl = \"{}\"\nsha256 = \"{}\"\n",
        server.url_str("/runtime.bkpatch"),
        sha256_hex(blob)
    )
}

fn v1_to_v2_patch(scratch: &Path) -> Vec<u8> {
    let target = scratch.join("patch-target");
    write_tree(&target, V2_FILES);
    let entries = scan_tree(&target).expect("must scan target");
    let manifest = entries
        .iter()
        .map(|entry| PatchManifestEntry {
            name: entry.path.clone(),
            kind: match entry.kind {
                TreeEntryKind::Dir => EntryKind::Dir,
                TreeEntryKind::File => EntryKind::File,
                TreeEntryKind::Link => EntryKind::Link,
            },
            mode: entry.mode,
            size: entry.size,
            sha256: entry.sha256.clone(),
        })
        .collect();

    let contents = PatchContents {
        source: version("1.0.0"),
        target: version("2.0.0"),
        manifest,
        add: Vec::new(),
        update: vec![UpdatedFile {
            name: "VERSION".to_string(),
            mode: 0o644,
            ops: vec![
                DeltaOp::Insert {
                    data: hex::encode("2"),
                },
                DeltaOp::Copy { offset: 1, len: 5 },
            ],
        }],
        delete: Vec::new(),
    };
    PatchBlob {
        header: PatchHeader::default(),
        contents: compress_contents(&contents).expect("must compress"),
    }
    .encode()
    .expect("must encode")
}

fn expect_get(server: &Server, path: &str, body: Vec<u8>, times: usize) {
    server.expect(
        Expectation::matching(request::method_path("GET", eq(path.to_string())))
            .times(times)
            .respond_with(status_code(200).body(body)),
    );
}

fn test_config(dir: &Path, manifest_url: String) -> UpdateConfig {
    UpdateConfig {
        manifest_url,
        data_root: Some(dir.join("data")),
        cache_root: Some(dir.join("cache")),
        network: NetworkConfig {
            max_attempts: 2,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..NetworkConfig::default()
        },
        ..UpdateConfig::default()
    }
}

fn updater_with(config: UpdateConfig) -> Updater {
    let layout = InstallLayout::from_config(&config, |_| None).expect("must build layout");
    Updater::from_config(config, layout).expect("must build updater")
}

fn updater(dir: &Path, server: &Server) -> Updater {
    updater_with(test_config(dir, server.url_str("/artifacts.toml")))
}

fn record(updater: &Updater) -> InstallRecord {
    InstallStateStore::new(updater.layout())
        .load(CLASS)
        .expect("must load record")
}

fn installed_version_file(outcome: &UpdateOutcome) -> String {
    fs::read_to_string(outcome.artifact().install_path.join("VERSION")).expect("must read VERSION")
}

fn install_build(updater: &Updater, server: &mut Server, build: &Build) {
    expect_get(server, "/artifacts.toml", build.toml(server).into_bytes(), 1);
    expect_get(server, &build.path(), build.archive.clone(), 1);
    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must install");
    assert_eq!(outcome.kind(), OutcomeKind::UpdatedByFetch);
    server.verify_and_clear();
}

#[test]
fn second_run_is_already_current_without_network() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    expect_get(&server, "/artifacts.toml", v1.toml(&server).into_bytes(), 1);
    expect_get(&server, &v1.path(), v1.archive.clone(), 1);

    let updater = updater(dir.path(), &server);
    let first = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("first run must install");
    assert_eq!(first.kind(), OutcomeKind::UpdatedByFetch);
    assert_eq!(installed_version_file(&first), "1.0.0\n");
    assert_eq!(first.artifact().content_sha256, v1.content_sha256);

    let second = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("second run must succeed");
    assert_eq!(second.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(second.artifact(), first.artifact());

    let state = record(&updater);
    assert_eq!(state.state, InstallState::Installed);
    assert!(!updater.layout().marker_path(CLASS).exists());
}

#[test]
fn update_uses_patch_for_installed_base() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    let v2 = Build::new(dir.path(), "2.0.0", V2_FILES);
    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.manifest_max_age_secs = 0;
    let updater = updater_with(config);
    install_build(&updater, &mut server, &v1);

    let blob = v1_to_v2_patch(dir.path());
    let manifest = format!("{}{}", v2.toml(&server), patch_toml(&server, "1.0.0", &blob));
    expect_get(&server, "/artifacts.toml", manifest.into_bytes(), 1);
    expect_get(&server, "/runtime.bkpatch", blob, 1);

    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must update");
    assert_eq!(outcome.kind(), OutcomeKind::UpdatedByPatch);
    assert_eq!(installed_version_file(&outcome), "2.0.0\n");
    assert_eq!(outcome.artifact().content_sha256, v2.content_sha256);

    let leftover_patches = fs::read_dir(updater.layout().patches_dir(CLASS))
        .map(|entries| entries.flatten().count())
        .unwrap_or(0);
    assert_eq!(leftover_patches, 0, "applied patch blobs must be pruned");
}

#[test]
fn corrupt_patch_falls_back_to_full_download() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    let v2 = Build::new(dir.path(), "2.0.0", V2_FILES);
    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.manifest_max_age_secs = 0;
    let updater = updater_with(config);
    install_build(&updater, &mut server, &v1);

    let blob = b"BKDELTA1\x02\x00\x00\x00{}not gzip".to_vec();
    let manifest = format!("{}{}", v2.toml(&server), patch_toml(&server, "1.0.0", &blob));
    expect_get(&server, "/artifacts.toml", manifest.into_bytes(), 1);
    expect_get(&server, "/runtime.bkpatch", blob, 1);
    expect_get(&server, &v2.path(), v2.archive.clone(), 1);

    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must update");
    assert_eq!(outcome.kind(), OutcomeKind::UpdatedByFetch);
    assert_eq!(installed_version_file(&outcome), "2.0.0\n");
    assert_eq!(outcome.artifact().content_sha256, v2.content_sha256);
}

#[test]
fn interrupted_install_leaves_previous_version_usable() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    let updater = updater(dir.path(), &server);
    install_build(&updater, &mut server, &v1);

    let installer = AtomicInstaller::new(updater.layout());
    let session = installer.begin(CLASS, &version("2.0.0")).expect("must begin");
    fs::write(session.staging_dir().join("VERSION"), "2.0.0\n").expect("must stage");
    drop(session);

    assert_eq!(record(&updater).state, InstallState::Installing);
    let public = updater.layout().install_path(CLASS);
    assert_eq!(fs::read_to_string(public.join("VERSION")).expect("read"), "1.0.0\n");

    expect_get(&server, "/artifacts.toml", v1.toml(&server).into_bytes(), 1);
    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must recover");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(installed_version_file(&outcome), "1.0.0\n");
    assert_eq!(record(&updater).state, InstallState::Installed);

    let leftovers: Vec<_> = fs::read_dir(updater.layout().store_dir())
        .expect("must read store")
        .flatten()
        .collect();
    assert_eq!(leftovers.len(), 1, "only the published tree may remain");
}

fn leave_interrupted_update(updater: &Updater, target: &str) {
    let installer = AtomicInstaller::new(updater.layout());
    let session = installer.begin(CLASS, &version(target)).expect("must begin");
    fs::write(session.staging_dir().join("VERSION"), format!("{target}\n")).expect("must stage");
    drop(session);
    assert_eq!(record(updater).state, InstallState::Installing);
}

#[test]
fn offline_launch_after_interrupted_update_uses_previous_version() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    install_build(&updater(dir.path(), &server), &mut server, &v1);

    let offline = updater_with(test_config(dir.path(), server.url_str("/mirror.toml")));
    leave_interrupted_update(&offline, "2.0.0");
    server.expect(
        Expectation::matching(request::method_path("GET", "/mirror.toml"))
            .times(2)
            .respond_with(status_code(503)),
    );

    let outcome = offline
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must launch the previous version");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(installed_version_file(&outcome), "1.0.0\n");
    assert_eq!(record(&offline).state, InstallState::Installed);
    assert!(!offline.layout().marker_path(CLASS).exists());
}

#[test]
fn cached_manifest_does_not_force_update_after_interrupted_update() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    let v2 = Build::new(dir.path(), "2.0.0", V2_FILES);
    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.manifest_max_age_secs = 0;
    let updater = updater_with(config);
    install_build(&updater, &mut server, &v1);

    // Leaves a cached manifest that lists 2.0.0.
    expect_get(&server, "/artifacts.toml", v2.toml(&server).into_bytes(), 1);
    server.expect(
        Expectation::matching(request::method_path("GET", eq(v2.path())))
            .times(2)
            .respond_with(status_code(503)),
    );
    let err = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect_err("download must fail");
    assert_eq!(err.kind(), OutcomeKind::FetchFailed);
    server.verify_and_clear();

    leave_interrupted_update(&updater, "2.0.0");
    server.expect(
        Expectation::matching(request::method_path("GET", "/artifacts.toml"))
            .times(2)
            .respond_with(status_code(503)),
    );
    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must launch the previous version");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(installed_version_file(&outcome), "1.0.0\n");
    assert_eq!(outcome.artifact().content_sha256, v1.content_sha256);
}

#[test]
fn disabled_updates_recover_interrupted_update_without_network() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    install_build(&updater(dir.path(), &server), &mut server, &v1);

    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.updates_enabled = false;
    let disabled = updater_with(config);
    leave_interrupted_update(&disabled, "2.0.0");

    let outcome = disabled
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must use the installed version");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(installed_version_file(&outcome), "1.0.0\n");
    assert!(!disabled.layout().marker_path(CLASS).exists());
}

#[test]
fn disabled_updates_do_not_wait_for_another_instance() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    install_build(&updater(dir.path(), &server), &mut server, &v1);

    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.updates_enabled = false;
    config.lock_timeout_secs = Some(1);
    let disabled = updater_with(config);
    leave_interrupted_update(&disabled, "2.0.0");
    let _held = ArtifactLock::acquire(disabled.layout(), CLASS, None).expect("must hold lock");

    let outcome = disabled
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must use the last confirmed install");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(outcome.artifact().version, version("1.0.0"));
    assert!(
        disabled.layout().marker_path(CLASS).exists(),
        "the lock holder owns the marker"
    );
}

#[test]
fn concurrent_updaters_perform_one_fetch() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    server.expect(
        Expectation::matching(request::method_path("GET", "/artifacts.toml"))
            .times(1..)
            .respond_with(status_code(200).body(v1.toml(&server))),
    );
    expect_get(&server, &v1.path(), v1.archive.clone(), 1);

    let outcomes: Vec<UpdateOutcome> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let config = test_config(dir.path(), server.url_str("/artifacts.toml"));
                scope.spawn(move || {
                    updater_with(config)
                        .ensure(CLASS, &VersionRequirement::Latest)
                        .expect("must succeed")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread must not panic"))
            .collect()
    });

    let fetched = outcomes
        .iter()
        .filter(|outcome| outcome.kind() == OutcomeKind::UpdatedByFetch)
        .count();
    assert_eq!(fetched, 1);
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.artifact().version == version("1.0.0")));
}

#[test]
fn lock_held_elsewhere_times_out() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    expect_get(&server, "/artifacts.toml", v1.toml(&server).into_bytes(), 1);

    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.lock_timeout_secs = Some(1);
    let updater = updater_with(config);
    updater.layout().ensure_base_dirs().expect("must create dirs");
    let _held = ArtifactLock::acquire(updater.layout(), CLASS, None).expect("must hold lock");

    let err = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect_err("must time out");
    assert!(matches!(err, UpdateError::LockTimeout { .. }));
    assert_eq!(err.kind(), OutcomeKind::LockTimeout);
}

#[test]
fn unreachable_manifest_falls_back_to_installed_version() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    install_build(&updater(dir.path(), &server), &mut server, &v1);

    server.expect(
        Expectation::matching(request::method_path("GET", "/mirror.toml"))
            .times(2)
            .respond_with(status_code(503)),
    );
    let offline = updater_with(test_config(dir.path(), server.url_str("/mirror.toml")));
    let outcome = offline
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must launch offline");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(installed_version_file(&outcome), "1.0.0\n");
}

#[test]
fn unreachable_manifest_without_install_is_fatal() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/artifacts.toml"))
            .times(2)
            .respond_with(status_code(502)),
    );

    let err = updater(dir.path(), &server)
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect_err("must fail");
    assert_eq!(err.kind(), OutcomeKind::ManifestUnavailable);
}

#[test]
fn corrupted_download_reports_verify_failure_and_cleans_up() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    expect_get(&server, "/artifacts.toml", v1.toml(&server).into_bytes(), 1);
    expect_get(&server, &v1.path(), b"truncated".to_vec(), 2);

    let updater = updater(dir.path(), &server);
    let err = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect_err("must fail verification");
    assert_eq!(err.kind(), OutcomeKind::VerifyFailed);

    let state = record(&updater);
    assert_eq!(state.state, InstallState::Absent);
    assert!(!updater.layout().marker_path(CLASS).exists());
}

#[test]
fn disabled_updates_skip_the_manifest() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    install_build(&updater(dir.path(), &server), &mut server, &v1);

    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.updates_enabled = false;
    config.manifest_max_age_secs = 0;
    let outcome = updater_with(config)
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must use the installed version");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
}

#[test]
fn older_manifest_release_is_not_a_downgrade() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let mut server = Server::run();
    let v1 = Build::new(dir.path(), "1.0.0", V1_FILES);
    let v2 = Build::new(dir.path(), "2.0.0", V2_FILES);
    let mut config = test_config(dir.path(), server.url_str("/artifacts.toml"));
    config.manifest_max_age_secs = 0;
    let updater = updater_with(config);
    install_build(&updater, &mut server, &v2);

    expect_get(&server, "/artifacts.toml", v1.toml(&server).into_bytes(), 1);
    let outcome = updater
        .ensure(CLASS, &VersionRequirement::Latest)
        .expect("must keep the newer install");
    assert_eq!(outcome.kind(), OutcomeKind::AlreadyCurrent);
    assert_eq!(outcome.artifact().version, version("2.0.0"));
}

fn sample_entry(content_sha256: Option<&str>) -> bundlekit_core::ManifestEntry {
    let content = content_sha256
        .map(|digest| format!("content_sha256 = \"{digest}\"\n"))
        .unwrap_or_default();
    let raw = format!(
        r#"
[artifacts.runtime-image]
version = "2.0.0"
url = "https://example.test/runtime-2.0.0.tar.gz"
sha256 = "{a}"
{content}
[[artifacts.runtime-image.history]]
version = "1.5.0"
url = "https://example.test/runtime-1.5.0.tar.gz"
sha256 = "{a}"

[[artifacts.runtime-image.patches]]
base = "1.0.0"
url = "https://example.test/runtime-1.0.0-to-2.0.0.bkpatch"
sha256 = "{a}"
"#,
        a = "a".repeat(64)
    );
    Manifest::from_toml_str(&raw)
        .expect("must parse manifest")
        .entry(CLASS)
        .cloned()
        .expect("must list runtime")
}

fn installed_record(dir: &Path, value: &str) -> InstallRecord {
    let layout = InstallLayout::new(dir.join("data"), dir.join("cache"));
    let installer = AtomicInstaller::new(&layout);
    let session = installer.begin(CLASS, &version(value)).expect("must begin");
    write_tree(session.staging_dir(), V1_FILES);
    let staged = bundlekit_installer::StagedContent {
        class: CLASS,
        version: version(value),
        dir: session.staging_dir().to_path_buf(),
        archive_sha256: "a".repeat(64),
        content_sha256: content_digest(session.staging_dir()).expect("must digest"),
        source: bundlekit_installer::InstallSource::Fetch,
    };
    installer.install(&session, staged).expect("must install");
    InstallStateStore::new(&layout).load(CLASS).expect("must load")
}

#[test]
fn plan_prefers_patch_only_with_content_digest() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let record = installed_record(dir.path(), "1.0.0");
    let digest = "b".repeat(64);

    let with_digest = plan_update(
        CLASS,
        &VersionRequirement::Latest,
        &record,
        &sample_entry(Some(&digest)),
        PlanOptions::default(),
    )
    .expect("must plan");
    assert!(matches!(with_digest, UpdatePlan::NeedsPatch { .. }));

    let without_digest = plan_update(
        CLASS,
        &VersionRequirement::Latest,
        &record,
        &sample_entry(None),
        PlanOptions::default(),
    )
    .expect("must plan");
    assert!(matches!(without_digest, UpdatePlan::NeedsFetch { .. }));

    let patches_off = plan_update(
        CLASS,
        &VersionRequirement::Latest,
        &record,
        &sample_entry(Some(&digest)),
        PlanOptions {
            patches_enabled: false,
            ..PlanOptions::default()
        },
    )
    .expect("must plan");
    assert!(matches!(patches_off, UpdatePlan::NeedsFetch { .. }));
}

#[test]
fn plan_handles_exact_versions_and_downgrades() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let record = installed_record(dir.path(), "3.0.0");
    let entry = sample_entry(None);

    let latest = plan_update(CLASS, &VersionRequirement::Latest, &record, &entry, PlanOptions::default())
        .expect("must plan");
    assert!(matches!(latest, UpdatePlan::UpToDate(_)));

    let downgrade = plan_update(
        CLASS,
        &VersionRequirement::Latest,
        &record,
        &entry,
        PlanOptions {
            allow_downgrade: true,
            ..PlanOptions::default()
        },
    )
    .expect("must plan");
    assert_eq!(
        downgrade.target().map(|release| release.version.clone()),
        Some(version("2.0.0"))
    );

    let pinned = plan_update(
        CLASS,
        &VersionRequirement::Exact(version("1.5.0")),
        &record,
        &entry,
        PlanOptions::default(),
    )
    .expect("must plan");
    assert!(matches!(pinned, UpdatePlan::NeedsFetch { ref release } if release.version == version("1.5.0")));

    let unknown = plan_update(
        CLASS,
        &VersionRequirement::Exact(version("9.9.9")),
        &record,
        &entry,
        PlanOptions::default(),
    )
    .expect_err("must reject unknown version");
    assert!(matches!(unknown, UpdateError::UnknownVersion { .. }));
}

#[test]
fn plan_without_install_needs_fetch() {
    let entry = sample_entry(None);
    let record = InstallRecord {
        class: CLASS,
        state: InstallState::Absent,
        installed: None,
        marker: None,
    };
    let plan = plan_update(CLASS, &VersionRequirement::Latest, &record, &entry, PlanOptions::default())
        .expect("must plan");
    assert!(matches!(plan, UpdatePlan::NeedsFetch { ref release } if release.version == version("2.0.0")));
}
