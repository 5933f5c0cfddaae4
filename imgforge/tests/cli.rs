//! Integration tests for the imgforge CLI.
//!
//! These tests run the compiled binary and verify its output.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;

/// Get imgforge command for testing.
///
/// Clears `IMGFORGE_RNG_SEED` and `IMGFORGE_ENGINE` so the host
/// environment cannot change seeds or the build engine.
fn imgforge() -> Command {
    let mut cmd = cargo_bin_cmd!("imgforge");
    cmd.env_remove("IMGFORGE_RNG_SEED");
    cmd.env_remove("IMGFORGE_ENGINE");
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn stdout_of(cmd: &mut Command) -> Vec<u8> {
    cmd.assert().success().get_output().stdout.clone()
}

fn write_manifest(temp: &assert_fs::TempDir) -> std::path::PathBuf {
    let path = temp.child("qcow2.json");
    imgforge()
        .args(["manifest", "--distro", "fedora", "--arch", "x86_64", "--type", "qcow2"])
        .arg("--output")
        .arg(path.path())
        .assert()
        .success();
    path.path().to_path_buf()
}

/// `build` with a store and output directory inside `temp`.
fn build(temp: &assert_fs::TempDir, manifest: &std::path::Path) -> Command {
    let mut cmd = imgforge();
    cmd.arg("build")
        .arg(manifest)
        .arg("--store")
        .arg(temp.child("store").path())
        .arg("--output-directory")
        .arg(temp.child("out").path());
    cmd
}

/// An engine stand-in: answers `--version` and prints `result` for builds.
fn fake_engine(
    temp: &assert_fs::TempDir,
    name: &str,
    version: &str,
    result: &str,
) -> std::path::PathBuf {
    let script = temp.child(name);
    script
        .write_str(&format!(
            "#!/bin/sh\n\
             if [ \"$1\" = \"--version\" ]; then echo \"osbuild {version}\"; exit 0; fi\n\
             cat > /dev/null\n\
             echo '{result}'\n"
        ))
        .unwrap();
    let mut perms = std::fs::metadata(script.path()).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(script.path(), perms).unwrap();
    script.path().to_path_buf()
}

const PARTITION_REQUEST: &str = r#"{
    "properties": {"type": "gpt", "default_size": "10 GiB", "create": {"bios_boot": true, "esp": true}},
    "partitions": [
        {"mountpoint": "/boot", "size": "1 GiB", "type": "xfs"},
        {"mountpoint": "/", "size": "5 GiB", "type": "xfs"}
    ]
}"#;

// ============================================================================
// Basic CLI tests
// ============================================================================

#[test]
fn cli_no_args_shows_help() {
    imgforge()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn cli_help_lists_commands() {
    imgforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manifest"))
        .stdout(predicate::str::contains("list-images"))
        .stdout(predicate::str::contains("gen-partition-table"))
        .stdout(predicate::str::contains("build"));
}

#[test]
fn cli_version() {
    imgforge()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("imgforge "));
}

#[test]
fn errors_are_one_line_and_exit_nonzero() {
    imgforge()
        .args(["manifest", "--distro", "plan9", "--arch", "x86_64", "--type", "qcow2"])
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error: "))
        .stderr(predicate::str::contains("plan9"));
}

// ============================================================================
// list-images
// ============================================================================

#[test]
fn list_images_json() {
    let out = stdout_of(imgforge().args(["list-images", "--json", "type:qcow2", "arch:aarch64"]));
    let images: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
    assert!(!images.is_empty());
    for image in &images {
        assert_eq!(image["image_type"], "qcow2");
        assert_eq!(image["arch"], "aarch64");
    }
}

#[test]
fn list_images_alias_and_table() {
    imgforge()
        .args(["ls", "distro:rhel*", "type:vmdk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rhel-9.6"))
        .stdout(predicate::str::contains("vmdk"))
        .stdout(predicate::str::contains("fedora").not());
}

// ============================================================================
// manifest
// ============================================================================

#[test]
fn manifest_to_stdout_is_reproducible() {
    let args = ["manifest", "--distro", "rhel-9.6", "--arch", "x86_64", "--type", "qcow2"];
    let first = stdout_of(imgforge().args(args).args(["--seed", "5"]));
    let second = stdout_of(imgforge().args(args).env("IMGFORGE_RNG_SEED", "5"));
    assert_eq!(first, second);

    let manifest: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(manifest["version"], "2");
    let names: Vec<_> = manifest["pipelines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names.first().map(String::as_str), Some("build"));
    assert!(names.iter().any(|n| n == "qcow2"));
}

#[test]
fn manifest_with_blueprint_to_file() {
    let temp = assert_fs::TempDir::new().unwrap();
    let blueprint = temp.child("bp.json");
    blueprint
        .write_str(r#"{"name": "web", "packages": [{"name": "nginx"}], "customizations": {"hostname": "web01"}}"#)
        .unwrap();
    let output = temp.child("out/manifest.json");
    std::fs::create_dir_all(temp.child("out").path()).unwrap();

    imgforge()
        .args(["manifest", "--distro", "fedora", "--arch", "aarch64", "--type", "raw"])
        .arg("-b")
        .arg(blueprint.path())
        .arg("-o")
        .arg(output.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    output.assert(predicate::str::contains("org.osbuild.hostname"));
    output.assert(predicate::str::contains("web01"));
}

#[test]
fn manifest_rejects_invalid_blueprint() {
    let temp = assert_fs::TempDir::new().unwrap();
    let blueprint = temp.child("bp.json");
    blueprint
        .write_str(r#"{"name": "x", "customizations": {"hostname": "-bad-"}}"#)
        .unwrap();
    imgforge()
        .args(["manifest", "--distro", "fedora", "--arch", "x86_64", "--type", "qcow2", "-b"])
        .arg(blueprint.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("customizations.hostname"));
}

#[test]
fn manifest_with_custom_repos() {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("fedora-42.json")
        .write_str(r#"{"x86_64": [{"name": "Local Mirror", "baseurl": ["http://mirror.local/f42"]}]}"#)
        .unwrap();
    imgforge()
        .args(["manifest", "--distro", "fedora", "--arch", "x86_64", "--type", "qcow2", "--repos"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("http://mirror.local/f42"));
}

// ============================================================================
// gen-partition-table / gen-partition-stages
// ============================================================================

#[test]
fn gen_partition_table_json() {
    let out = stdout_of(
        imgforge()
            .args(["gen-partition-table", "--seed", "1"])
            .write_stdin(PARTITION_REQUEST),
    );
    let response: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let constants = &response["const"];
    assert_eq!(constants["partition_table"]["type"], "gpt");
    assert_eq!(constants["filename"], "disk.img");
    assert!(constants["partition_table"]["size"].as_u64().unwrap() >= 10 << 30);
    let opts = constants["kernel_opts_list"].as_array().unwrap();
    assert!(opts[0].as_str().unwrap().starts_with("root=UUID="));
    assert!(constants["partition_map"]["root"]["uuid"].is_string());
    assert!(constants["internal"]["partition-table"].is_object());
}

#[test]
fn gen_partition_table_text() {
    imgforge()
        .args(["gen-partition-table", "--text"])
        .write_stdin(PARTITION_REQUEST)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("gpt table"))
        .stdout(predicate::str::contains("at /boot/efi"));
}

#[test]
fn gen_partition_table_rejects_unknown_fields() {
    imgforge()
        .arg("gen-partition-table")
        .write_stdin(r#"{"properties": {"type": "gpt", "colour": "blue"}}"#)
        .assert()
        .failure()
        .stderr(predicate::str::contains("colour"));
}

#[test]
fn partition_table_feeds_stage_generator() {
    let temp = assert_fs::TempDir::new().unwrap();
    let table = stdout_of(
        imgforge()
            .args(["gen-partition-table", "--seed", "3"])
            .write_stdin(PARTITION_REQUEST),
    );
    let table_file = temp.child("table.json");
    table_file.write_binary(&table).unwrap();

    let out = stdout_of(
        imgforge()
            .args(["gen-partition-stages", "--tool", "sgdisk", "-i"])
            .arg(table_file.path()),
    );
    let stages: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let types: Vec<_> = stages["prepare"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types[0], "org.osbuild.truncate");
    assert_eq!(types[1], "org.osbuild.sgdisk");
    assert!(types.iter().any(|t| t == "org.osbuild.mkfs.xfs"));
    assert!(types.iter().any(|t| t == "org.osbuild.mkfs.fat"));
}

// ============================================================================
// inspect / schema / completions
// ============================================================================

#[test]
fn inspect_summarizes_manifest() {
    let temp = assert_fs::TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    imgforge()
        .args(["inspect", "--stages"])
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("org.osbuild.rpm"))
        .stdout(predicate::str::contains("Sources"));
}

#[test]
fn inspect_rejects_garbage() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("garbage.json");
    file.write_str("{not json").unwrap();
    imgforge()
        .arg("inspect")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("error: "));
}

#[test]
fn schema_prints_blueprint_schema() {
    let out = stdout_of(imgforge().arg("schema"));
    let schema: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert!(schema["properties"]["customizations"].is_object());
}

#[test]
fn schema_generate_writes_files() {
    let temp = assert_fs::TempDir::new().unwrap();
    imgforge()
        .args(["schema", "generate", "--output"])
        .arg(temp.path())
        .assert()
        .success();
    temp.child("blueprint.schema.json").assert(predicate::path::exists());
    temp.child("repository.schema.json").assert(predicate::path::exists());
}

#[test]
fn completions_bash() {
    imgforge()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gen-partition-table"));
}

// ============================================================================
// build
// ============================================================================

#[test]
fn build_rejects_old_engine() {
    let temp = assert_fs::TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    let engine = fake_engine(&temp, "old-osbuild", "100", r#"{"success": true}"#);
    build(&temp, &manifest)
        .env("IMGFORGE_ENGINE", &engine)
        .assert()
        .failure()
        .stderr(predicate::str::contains("older than the required"));
}

#[test]
fn build_reports_engine_result() {
    let temp = assert_fs::TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    let ok = fake_engine(&temp, "good-osbuild", "131", r#"{"type": "result", "success": true}"#);
    build(&temp, &manifest)
        .env("IMGFORGE_ENGINE", &ok)
        .args(["--export", "qcow2"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Artifacts are in"));

    let failing = fake_engine(
        &temp,
        "failing-osbuild",
        "131",
        r#"{"success": false, "title": "stage failed", "errors": [{"message": "disk full"}]}"#,
    );
    build(&temp, &manifest)
        .env("IMGFORGE_ENGINE", &failing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("disk full"))
        .stderr(predicate::str::contains("build failed: stage failed"));
}

#[test]
fn build_rejects_unknown_export() {
    let temp = assert_fs::TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    build(&temp, &manifest)
        .args(["--export", "nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no pipeline \"nonexistent\""));
}
