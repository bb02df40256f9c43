use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use seqrun_upload_core::contract::MockObjectStore;
use seqrun_upload_core::transfer::{local_digest, upload_run};
use seqrun_upload_core::{
    PutObject, PutObjectOutput, RetryPolicy, RunDirectory, StateStore, TransferOptions,
    UploadTarget,
};

struct Fixture {
    _tmp: TempDir,
    run: RunDirectory,
    state: StateStore,
    target: UploadTarget,
}

fn fixture(files: &[(&str, &str)]) -> Fixture {
    let tmp = tempdir().unwrap();
    let run_path = tmp.path().join("runs/run_1");
    for (relative, contents) in files {
        let path = run_path.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    let run = RunDirectory::from_path(&run_path).unwrap();
    let state = StateStore::new(tmp.path().join("logs/uploads"));
    let target = UploadTarget {
        bucket: "bucket".to_string(),
        remote_prefix: "/sequencing/".to_string(),
        sample_regex: None,
        roots: vec![run.root.clone()],
    };
    Fixture {
        _tmp: tmp,
        run,
        state,
        target,
    }
}

fn options() -> TransferOptions {
    TransferOptions {
        cores: 2,
        threads: 2,
        retry: RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    }
}

fn honest_put(req: PutObject) -> Result<PutObjectOutput, Box<dyn std::error::Error + Send + Sync>> {
    Ok(PutObjectOutput {
        etag: format!("\"{}\"", local_digest(&req.local_path)?),
    })
}

fn honest_store() -> MockObjectStore {
    let mut store = MockObjectStore::new();
    store.expect_put_object().returning(honest_put);
    store
}

fn name_of(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

#[tokio::test]
async fn uploads_every_file_under_its_remote_key() {
    let f = fixture(&[("a.txt", "aaaa"), ("Data/b.txt", "bb"), ("c.txt", "c")]);
    let keys = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&keys);
    let mut store = MockObjectStore::new();
    store.expect_put_object().times(3).returning(move |req| {
        assert_eq!(req.bucket, "bucket");
        seen.lock().unwrap().push(req.key.clone());
        honest_put(req)
    });

    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.attempted, 3);
    assert_eq!(outcome.uploaded, 3);
    let mut keys = keys.lock().unwrap().clone();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "sequencing/run_1/Data/b.txt",
            "sequencing/run_1/a.txt",
            "sequencing/run_1/c.txt"
        ]
    );

    let saved = f.state.load(&f.run).unwrap().unwrap();
    assert!(saved.completed);
    assert_eq!(saved.total_local_files, 3);
    assert_eq!(saved.total_uploaded_files, 3);
    assert_eq!(
        saved.uploaded_files[&f.run.path.join("a.txt").to_string_lossy().into_owned()],
        "74b87337454200d4d33f80c4663dc5e5"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_outcome_is_saved_with_many_concurrent_transfers() {
    let names: Vec<(String, String)> = (0..64)
        .map(|i| (format!("Data/tile_{i:02}.bcl"), "x".repeat(i + 1)))
        .collect();
    let files: Vec<(&str, &str)> = names.iter().map(|(n, c)| (n.as_str(), c.as_str())).collect();
    let f = fixture(&files);

    let options = TransferOptions {
        cores: 4,
        threads: 8,
        ..options()
    };
    let outcome = upload_run(Arc::new(honest_store()), &f.state, &f.run, &f.target, None, &options)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.uploaded, 64);
    let saved = f.state.load(&f.run).unwrap().unwrap();
    assert!(saved.completed);
    assert_eq!(saved.total_uploaded_files, 64);
    assert_eq!(saved.uploaded_files.len(), 64);
    assert_eq!(saved, outcome.record);
}

#[tokio::test]
async fn second_upload_of_a_finished_run_sends_nothing() {
    let f = fixture(&[("a.txt", "aaaa"), ("b.txt", "bb")]);
    upload_run(Arc::new(honest_store()), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    let mut idle = MockObjectStore::new();
    idle.expect_put_object().times(0);
    let record = f.state.load(&f.run).unwrap();
    let outcome = upload_run(Arc::new(idle), &f.state, &f.run, &f.target, record, &options())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.attempted, 0);
}

#[tokio::test]
async fn interrupted_upload_resumes_with_the_remaining_files() {
    let f = fixture(&[
        ("a.txt", "1"),
        ("b.txt", "22"),
        ("c.txt", "333"),
        ("d.txt", "4444"),
        ("e.txt", "55555"),
    ]);

    // first attempt: d and e never make it
    let mut flaky = MockObjectStore::new();
    flaky.expect_put_object().returning(|req| {
        match name_of(&req.local_path).as_str() {
            "d.txt" | "e.txt" => Err("connection reset".into()),
            _ => honest_put(req),
        }
    });
    let first = upload_run(Arc::new(flaky), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();
    assert!(!first.is_complete());
    assert_eq!(first.record.total_uploaded_files, 3);

    let sent = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sent);
    let mut store = MockObjectStore::new();
    store.expect_put_object().times(2).returning(move |req| {
        seen.lock().unwrap().push(name_of(&req.local_path));
        honest_put(req)
    });
    let record = f.state.load(&f.run).unwrap();
    let second = upload_run(Arc::new(store), &f.state, &f.run, &f.target, record, &options())
        .await
        .unwrap();

    assert!(second.is_complete());
    let mut sent = sent.lock().unwrap().clone();
    sent.sort();
    assert_eq!(sent, vec!["d.txt", "e.txt"]);
    assert!(second.record.failed_upload_files.is_empty());
}

#[tokio::test]
async fn one_failing_file_leaves_the_run_incomplete() {
    let f = fixture(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);
    let mut store = MockObjectStore::new();
    store.expect_put_object().returning(|req| {
        if name_of(&req.local_path) == "c.txt" {
            Err("access denied".into())
        } else {
            honest_put(req)
        }
    });

    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    let c = f.run.path.join("c.txt").to_string_lossy().into_owned();
    assert!(!outcome.is_complete());
    assert_eq!(outcome.failed, vec![c.clone()]);

    let saved = f.state.load(&f.run).unwrap().unwrap();
    assert!(!saved.completed);
    assert_eq!(saved.total_uploaded_files, 2);
    assert_eq!(saved.total_failed_upload, 1);
    assert_eq!(saved.failed_upload_files, vec![c.clone()]);
    assert!(!saved.uploaded_files.contains_key(&c));
}

#[tokio::test]
async fn changed_file_is_uploaded_again() {
    let f = fixture(&[("a.txt", "original"), ("b.txt", "unchanged")]);
    upload_run(Arc::new(honest_store()), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    fs::write(f.run.path.join("a.txt"), "rewritten by the instrument").unwrap();

    let mut store = MockObjectStore::new();
    store
        .expect_put_object()
        .withf(|req| req.key == "sequencing/run_1/a.txt")
        .times(1)
        .returning(honest_put);
    let record = f.state.load(&f.run).unwrap();
    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, record, &options())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.attempted, 1);
    let key = f.run.path.join("a.txt").to_string_lossy().into_owned();
    assert_eq!(
        outcome.record.uploaded_files[&key],
        local_digest(&f.run.path.join("a.txt")).unwrap()
    );
}

#[tokio::test]
async fn changed_file_that_fails_to_upload_again_is_not_counted() {
    let f = fixture(&[("a.txt", "original"), ("b.txt", "unchanged")]);
    upload_run(Arc::new(honest_store()), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    fs::write(f.run.path.join("a.txt"), "rewritten by the instrument").unwrap();

    let mut store = MockObjectStore::new();
    store
        .expect_put_object()
        .returning(|_| Err("connection reset".into()));
    let record = f.state.load(&f.run).unwrap();
    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, record, &options())
        .await
        .unwrap();

    let a = f.run.path.join("a.txt").to_string_lossy().into_owned();
    assert!(!outcome.is_complete());
    assert_eq!(outcome.failed, vec![a.clone()]);

    let saved = f.state.load(&f.run).unwrap().unwrap();
    assert!(!saved.completed);
    assert_eq!(saved.total_local_files, 2);
    assert_eq!(saved.total_uploaded_files, 1);
    assert_eq!(saved.failed_upload_files, vec![a.clone()]);
    assert!(!saved.uploaded_files.contains_key(&a));
    assert_eq!(
        saved.completed,
        saved.total_uploaded_files == saved.total_local_files
    );
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let f = fixture(&[("a.txt", "a")]);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut store = MockObjectStore::new();
    store.expect_put_object().times(2).returning(move |req| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("503 slow down".into())
        } else {
            honest_put(req)
        }
    });

    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_failure_stops_after_the_attempt_limit() {
    let f = fixture(&[("a.txt", "a")]);
    let mut store = MockObjectStore::new();
    store
        .expect_put_object()
        .times(3)
        .returning(|_| Err("timeout".into()));

    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.failed.len(), 1);
}

#[tokio::test]
async fn mismatching_entity_tag_counts_as_failure() {
    let f = fixture(&[("a.txt", "a")]);
    let mut store = MockObjectStore::new();
    store.expect_put_object().times(3).returning(|_| {
        Ok(PutObjectOutput {
            etag: "00000000000000000000000000000000".to_string(),
        })
    });

    let outcome = upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    assert!(!outcome.is_complete());
    assert!(outcome.record.uploaded_files.is_empty());
}

#[tokio::test]
async fn multipart_entity_tags_are_trusted() {
    let f = fixture(&[("a.txt", "a")]);
    let mut store = MockObjectStore::new();
    store.expect_put_object().times(1).returning(|_| {
        Ok(PutObjectOutput {
            etag: "9b2cf535f27731c974343645a3985328-2".to_string(),
        })
    });
    upload_run(Arc::new(store), &f.state, &f.run, &f.target, None, &options())
        .await
        .unwrap();

    fs::write(f.run.path.join("a.txt"), "changed").unwrap();
    let mut idle = MockObjectStore::new();
    idle.expect_put_object().times(0);
    let record = f.state.load(&f.run).unwrap();
    let outcome = upload_run(Arc::new(idle), &f.state, &f.run, &f.target, record, &options())
        .await
        .unwrap();
    assert!(outcome.is_complete());
}

#[tokio::test]
async fn empty_run_completes_without_transfers() {
    let tmp = tempdir().unwrap();
    let run_path = tmp.path().join("run_1");
    fs::create_dir_all(&run_path).unwrap();
    let run = RunDirectory::from_path(&run_path).unwrap();
    let state = StateStore::new(tmp.path().join("uploads"));
    let target = UploadTarget {
        bucket: "bucket".to_string(),
        remote_prefix: String::new(),
        sample_regex: None,
        roots: vec![run.root.clone()],
    };

    let mut idle = MockObjectStore::new();
    idle.expect_put_object().times(0);
    let outcome = upload_run(Arc::new(idle), &state, &run, &target, None, &options())
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.record.total_local_files, 0);
}
