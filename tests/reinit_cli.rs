//! CLI-level tests for `afd-reinit` (§4.H).

use assert_cmd::Command;
use std::fs;

#[test]
fn level_below_3_leaves_fsa_generations_untouched() {
    let work_dir = tempfile::tempdir().expect("tempdir");
    let fifo_dir = work_dir.path().join("fifo_dir");
    fs::create_dir_all(&fifo_dir).expect("mkdir fifo_dir");
    fs::write(fifo_dir.join("fsa.stat.0"), b"x").expect("seed fsa.stat.0");

    Command::cargo_bin("afd-reinit")
        .expect("binary builds")
        .args([work_dir.path().to_str().expect("utf8 path"), "2"])
        .assert()
        .success();

    assert!(fifo_dir.join("fsa.stat.0").exists());
}

#[test]
fn level_3_removes_fsa_generation_files() {
    let work_dir = tempfile::tempdir().expect("tempdir");
    let fifo_dir = work_dir.path().join("fifo_dir");
    fs::create_dir_all(&fifo_dir).expect("mkdir fifo_dir");
    fs::write(fifo_dir.join("fsa.stat.0"), b"x").expect("seed fsa.stat.0");
    fs::write(fifo_dir.join("fsa.stat.1"), b"x").expect("seed fsa.stat.1");

    Command::cargo_bin("afd-reinit")
        .expect("binary builds")
        .args([work_dir.path().to_str().expect("utf8 path"), "3"])
        .assert()
        .success();

    assert!(!fifo_dir.join("fsa.stat.0").exists());
    assert!(!fifo_dir.join("fsa.stat.1").exists());
}
