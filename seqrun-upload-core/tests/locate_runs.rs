use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

use seqrun_upload_core::run::{check_run, locate_runs, LocatorOptions, RunCheck};

fn make_run(root: &Path, name: &str, termination: Option<&str>) -> PathBuf {
    let run = root.join(name);
    fs::create_dir_all(&run).unwrap();
    fs::write(run.join("RunInfo.xml"), "<RunInfo/>").unwrap();
    if let Some(file) = termination {
        fs::write(run.join(file), "").unwrap();
    }
    run
}

fn ids(runs: &[seqrun_upload_core::RunDirectory]) -> Vec<String> {
    runs.iter().map(|r| r.run_id.clone()).collect()
}

#[test]
fn finished_runs_are_found_for_every_termination_file() {
    let tmp = tempdir().unwrap();
    make_run(tmp.path(), "run_a", Some("CopyComplete.txt"));
    make_run(tmp.path(), "run_b", Some("RTAComplete.txt"));
    make_run(tmp.path(), "run_c", Some("RTAComplete.xml"));

    let runs = locate_runs(&[tmp.path().to_path_buf()], &LocatorOptions::default());
    assert_eq!(ids(&runs), vec!["run_a", "run_b", "run_c"]);
    assert!(runs.iter().all(|r| r.path.is_absolute()));
}

#[test]
fn unfinished_and_foreign_directories_are_left_alone() {
    let tmp = tempdir().unwrap();
    let running = make_run(tmp.path(), "still_sequencing", None);
    fs::create_dir_all(tmp.path().join("not_a_run")).unwrap();
    fs::write(tmp.path().join("stray_file.txt"), "x").unwrap();

    let runs = locate_runs(&[tmp.path().to_path_buf()], &LocatorOptions::default());
    assert!(runs.is_empty());
    assert_eq!(check_run(&running, &LocatorOptions::default()), RunCheck::Incomplete);
    assert_eq!(
        check_run(&tmp.path().join("not_a_run"), &LocatorOptions::default()),
        RunCheck::NotARun
    );
}

#[test]
fn skip_check_accepts_any_subdirectory() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("plain_dir")).unwrap();
    make_run(tmp.path(), "still_sequencing", None);

    let runs = locate_runs(
        &[tmp.path().to_path_buf()],
        &LocatorOptions { skip_check: true },
    );
    assert_eq!(ids(&runs), vec!["plain_dir", "still_sequencing"]);
}

#[test]
fn a_run_reachable_twice_is_returned_once() {
    let tmp = tempdir().unwrap();
    make_run(tmp.path(), "run_a", Some("CopyComplete.txt"));
    let same_root_again = tmp.path().join(".").to_path_buf();

    let runs = locate_runs(
        &[tmp.path().to_path_buf(), same_root_again],
        &LocatorOptions::default(),
    );
    assert_eq!(ids(&runs), vec!["run_a"]);
}

#[test]
fn unreadable_root_does_not_stop_the_scan() {
    let tmp = tempdir().unwrap();
    make_run(tmp.path(), "run_a", Some("CopyComplete.txt"));

    let runs = locate_runs(
        &[tmp.path().join("does_not_exist"), tmp.path().to_path_buf()],
        &LocatorOptions::default(),
    );
    assert_eq!(ids(&runs), vec!["run_a"]);
}
