//! CLI-level tests for the `afd-sf`/`afd-gf` worker binaries (§6 exit codes).

use assert_cmd::Command;

#[test]
fn afd_sf_exits_with_open_file_dir_error_when_no_host_is_configured() {
    let work_dir = tempfile::tempdir().expect("tempdir");

    Command::cargo_bin("afd-sf")
        .expect("binary builds")
        .args([work_dir.path().to_str().expect("utf8 path"), "1", "0", "0", "0"])
        .assert()
        .code(5);
}

#[test]
fn afd_sf_rejects_oversized_positional_as_syntax_error() {
    let work_dir = tempfile::tempdir().expect("tempdir");
    let oversized = "1".repeat(64);

    Command::cargo_bin("afd-sf")
        .expect("binary builds")
        .args([work_dir.path().to_str().expect("utf8 path"), &oversized, "0", "0", "0"])
        .assert()
        .code(255); // AttachFailed path short-circuits on decode() before DB is even touched
}

#[test]
fn afd_gf_help_runs_without_touching_the_filesystem() {
    Command::cargo_bin("afd-gf")
        .expect("binary builds")
        .arg("--help")
        .assert()
        .success();
}
