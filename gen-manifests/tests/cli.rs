//! Integration tests for the gen-manifests binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_fs::prelude::*;
use predicates::prelude::*;

fn gen_manifests() -> Command {
    let mut cmd = cargo_bin_cmd!("gen-manifests");
    cmd.env_remove("IMGFORGE_RNG_SEED");
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn dry_run_lists_one_job_per_image_type() {
    gen_manifests()
        .args(["--dry-run", "--fake-resolvers", "--distros", "fedora*", "--arches", "x86_64"])
        .args(["--images", "qcow2,raw"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fedora-42,x86_64,qcow2,empty"))
        .stdout(predicate::str::contains("fedora-42,x86_64,raw,empty"))
        .stdout(predicate::str::contains("rhel").not());
}

#[test]
fn writes_named_manifests() {
    let out = assert_fs::TempDir::new().unwrap();
    gen_manifests()
        .arg("--output")
        .arg(out.path())
        .args(["--fake-resolvers", "--workers", "4"])
        .args(["--distros", "rhel-9.6", "--arches", "aarch64", "--images", "qcow2,container-tar"])
        .assert()
        .success();

    let qcow2 = out.child("rhel_9.6-aarch64-qcow2-empty.json");
    qcow2.assert(predicate::path::is_file());
    out.child("rhel_9.6-aarch64-container_tar-empty.json")
        .assert(predicate::path::is_file());

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(qcow2.path()).unwrap()).unwrap();
    assert_eq!(manifest["version"], "2");
}

#[test]
fn output_is_reproducible() {
    let a = assert_fs::TempDir::new().unwrap();
    let b = assert_fs::TempDir::new().unwrap();
    for dir in [&a, &b] {
        gen_manifests()
            .arg("--output")
            .arg(dir.path())
            .args(["--fake-resolvers", "--distros", "fedora-42", "--arches", "x86_64"])
            .args(["--images", "vmdk"])
            .assert()
            .success();
    }
    let name = "fedora_42-x86_64-vmdk-empty.json";
    assert_eq!(
        std::fs::read(a.path().join(name)).unwrap(),
        std::fs::read(b.path().join(name)).unwrap()
    );
}

#[test]
fn shipped_configs_generate() {
    let configs = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../imgforge/data/configs");
    let out = assert_fs::TempDir::new().unwrap();
    gen_manifests()
        .arg("--output")
        .arg(out.path())
        .arg("--configs")
        .arg(&configs)
        .args(["--fake-resolvers", "--distros", "fedora", "--arches", "x86_64"])
        .args(["--images", "qcow2,iot-raw"])
        .assert()
        .success();

    for name in [
        "fedora_42-x86_64-qcow2-empty.json",
        "fedora_42-x86_64-qcow2-server.json",
        "fedora_42-x86_64-iot_raw-empty.json",
        "fedora_42-x86_64-iot_raw-iot.json",
    ] {
        out.child(name).assert(predicate::path::is_file());
    }
    out.child("fedora_42-x86_64-qcow2-server.json")
        .assert(predicate::str::contains("server01"));
    out.child("fedora_42-x86_64-iot_raw-iot.json")
        .assert(predicate::str::contains("https://ostree.example.com/repo"));
}

#[test]
fn configs_without_a_match_fail_unless_skipped() {
    let configs = assert_fs::TempDir::new().unwrap();
    configs
        .child("iot.json")
        .write_str(r#"{"name": "iot", "options": {"ostree": {"ref": "test/iot"}}}"#)
        .unwrap();
    configs
        .child("config-list.json")
        .write_str(r#"[{"path": "iot.json", "filters": {"image-types": ["iot-*"]}}]"#)
        .unwrap();

    gen_manifests()
        .args(["--dry-run", "--fake-resolvers", "--distros", "fedora-42"])
        .arg("--configs")
        .arg(configs.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--skip-noconfig"));

    gen_manifests()
        .args(["--dry-run", "--fake-resolvers", "--skip-noconfig", "--distros", "fedora-42"])
        .arg("--configs")
        .arg(configs.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("iot-raw,iot"))
        .stdout(predicate::str::contains("qcow2").not());
}

#[test]
fn failed_jobs_are_collected() {
    let configs = assert_fs::TempDir::new().unwrap();
    configs
        .child("bad.json")
        .write_str(r#"{"name": "bad", "blueprint": {"containers": [{"source": "registry.example.com//broken"}]}}"#)
        .unwrap();
    let out = assert_fs::TempDir::new().unwrap();

    gen_manifests()
        .arg("--output")
        .arg(out.path())
        .arg("--configs")
        .arg(configs.path())
        .args(["--fake-resolvers", "--distros", "fedora-42", "--arches", "x86_64"])
        .args(["--images", "qcow2,raw"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Encountered 2 errors"))
        .stderr(predicate::str::contains("[fedora_42-x86_64-qcow2-bad.json] failed"))
        .stderr(predicate::str::contains("error: 2 of 2 manifests failed"));
}

#[test]
fn bad_glob_is_rejected() {
    gen_manifests()
        .args(["--dry-run", "--distros", "[unclosed"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid --distros glob"));
}
