//! Durability across a destination outage.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use perfflux::{CancellationToken, Config, DataPoint, Destination, Outcome, Pipeline};

/// Refuses every write while `down` is set, then records what it receives.
#[derive(Default)]
struct Scripted {
    down: AtomicBool,
    refused: AtomicUsize,
    lines: Mutex<Vec<String>>,
}

impl Scripted {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Destination for Scripted {
    fn write(&self, body: String) -> BoxFuture<'_, Outcome> {
        let outcome = match self.down.load(Ordering::SeqCst) {
            true => {
                self.refused.fetch_add(1, Ordering::SeqCst);
                Outcome::Retryable("scripted outage".to_string())
            }
            false => {
                self.lines.lock().unwrap().extend(body.lines().map(str::to_string));
                Outcome::Delivered
            }
        };

        futures::future::ready(outcome).boxed()
    }

    fn ping(&self) -> BoxFuture<'_, bool> {
        futures::future::ready(!self.down.load(Ordering::SeqCst)).boxed()
    }
}

fn config(root: &Path) -> Config {
    format!(
        r#"
        [spool]
        nagios_folder = '{spool}'
        poll_interval = "20ms"
        min_file_age = "0s"

        [pool]
        batch_size = 7
        batch_timeout = "10ms"
        sample_interval = "50ms"

        [series]
        emit_thresholds = false

        [dump]
        path = '{dump}'
        replay_interval = "50ms"
        "#,
        spool = root.join("spool").display(),
        dump = root.join("perfflux.dump").display(),
    )
    .parse()
    .unwrap()
}

/// Writes under a hidden name first so the watcher never sees a partial file.
fn drop_spool_file(root: &Path, name: &str, contents: &str) {
    let hidden = root.join(format!("spool/.{name}"));
    std::fs::write(&hidden, contents).unwrap();
    std::fs::rename(hidden, root.join("spool").join(name)).unwrap();
}

fn spool_file(host: &str, checks: i64) -> String {
    (0..checks)
        .map(|i| {
            format!(
                "DATATYPE::SERVICEPERFDATA\tTIMET::{}\tHOSTNAME::{host}\tSERVICEDESC::load\tSERVICEPERFDATA::load1={i}\tSERVICECHECKCOMMAND::check_load\n",
                1_000 + i
            )
        })
        .collect()
}

fn expected_lines(host: &str, checks: i64) -> Vec<String> {
    (0..checks)
        .map(|i| format!("{host}&load&check_load&load1&value value={i} {}", (1_000 + i) * 1_000))
        .collect()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outage_is_bridged_by_the_dump() {
    let dir = tempfile::tempdir().unwrap();
    let destination = Arc::new(Scripted::default());
    destination.down.store(true, Ordering::SeqCst);

    let cxl = CancellationToken::new();
    let pipeline = Pipeline::start_with(cxl.clone(), config(dir.path()), destination.clone())
        .await
        .unwrap();
    let stats = pipeline.stats().clone();

    drop_spool_file(dir.path(), "perfdata.1", &spool_file("web1", 30));
    eventually("all points dumped", || stats.snapshot().points_dumped == 30).await;
    assert!(destination.refused.load(Ordering::SeqCst) > 0);
    assert!(destination.lines().is_empty());

    destination.down.store(false, Ordering::SeqCst);
    eventually("replayed points delivered", || destination.lines().len() >= 30).await;

    let mut lines = destination.lines();
    lines.sort();
    let mut expected = expected_lines("web1", 30);
    expected.sort();
    assert_eq!(lines, expected);

    let dump = pipeline.dump().clone();
    let mut dump_empty = false;
    for _ in 0..100 {
        if dump.len_bytes().await.unwrap() == 0 {
            dump_empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dump_empty);

    cxl.cancel();
    pipeline.join().await;

    let stats = stats.snapshot();
    assert_eq!(stats.points_replayed, 30);
    assert_eq!(stats.points_delivered, 30);
    assert_eq!(stats.points_dropped, 0);
    assert_eq!(stats.dump_failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaying_the_same_records_twice_delivers_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let destination = Arc::new(Scripted::default());

    let cxl = CancellationToken::new();
    let pipeline = Pipeline::start_with(cxl.clone(), config(dir.path()), destination.clone())
        .await
        .unwrap();

    let batch: Vec<_> = (0..3).map(|i| DataPoint::new(format!("m{i}"), i, 1.0)).collect();
    pipeline.dump().append(&batch).await.unwrap();
    pipeline.dump().append(&batch).await.unwrap();

    eventually("duplicates delivered", || destination.lines().len() >= 6).await;
    cxl.cancel();
    pipeline.join().await;

    let mut lines = destination.lines();
    lines.sort();
    assert_eq!(
        lines,
        ["m0 value=1 0", "m0 value=1 0", "m1 value=1 1", "m1 value=1 1", "m2 value=1 2", "m2 value=1 2"]
    );
    assert_eq!(destination.refused.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_outage_keeps_everything_in_the_dump() {
    let dir = tempfile::tempdir().unwrap();
    let destination = Arc::new(Scripted::default());
    destination.down.store(true, Ordering::SeqCst);

    let cxl = CancellationToken::new();
    let pipeline = Pipeline::start_with(cxl.clone(), config(dir.path()), destination.clone())
        .await
        .unwrap();
    let stats = pipeline.stats().clone();

    drop_spool_file(dir.path(), "perfdata.1", &spool_file("db1", 12));
    eventually("file consumed", || stats.snapshot().points_enqueued == 12).await;
    cxl.cancel();
    pipeline.join().await;
    assert_eq!(stats.snapshot().points_dumped, 12);

    // A fresh run picks the dump up and delivers it.
    destination.down.store(false, Ordering::SeqCst);
    let cxl = CancellationToken::new();
    let pipeline = Pipeline::start_with(cxl.clone(), config(dir.path()), destination.clone())
        .await
        .unwrap();

    eventually("previous run delivered", || destination.lines().len() >= 12).await;
    cxl.cancel();
    pipeline.join().await;

    let mut lines = destination.lines();
    lines.sort();
    let mut expected = expected_lines("db1", 12);
    expected.sort();
    assert_eq!(lines, expected);
}
