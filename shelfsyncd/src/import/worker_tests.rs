use super::*;
use crate::catalog::TaskState;
use crate::catalog::tests::make_store;
use crate::events::{EventBus, drain};
use shelfsync_core::{PathToken, PathTokenResolver, SourceToken};
use tempfile::{TempDir, tempdir};

struct Fixture {
    _dir: TempDir,
    sources: PathBuf,
    library: PathBuf,
    queue: CopyTaskQueue,
    worker: CopyWorker,
}

async fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let sources = dir.path().join("sources");
    let library = dir.path().join("library");
    std::fs::create_dir_all(&sources).unwrap();
    std::fs::create_dir_all(&library).unwrap();
    let queue = CopyTaskQueue::new(make_store().await, EventBus::default());
    let worker = CopyWorker::new(queue.clone(), Arc::new(PathTokenResolver), &library);
    Fixture {
        _dir: dir,
        sources,
        library,
        queue,
        worker,
    }
}

impl Fixture {
    fn source(&self, name: &str, contents: &[u8]) -> Vec<u8> {
        let path = self.sources.join(name);
        std::fs::write(&path, contents).unwrap();
        PathToken::new(path).unwrap().serialize()
    }
}

#[test]
fn candidate_names_number_before_extension() {
    assert_eq!(candidate_name("x.mp3", 0), "x.mp3");
    assert_eq!(candidate_name("x.mp3", 1), "x-1.mp3");
    assert_eq!(candidate_name("a.b.flac", 2), "a.b-2.flac");
    assert_eq!(candidate_name("README", 1), "README-1");
    assert_eq!(candidate_name(".mp3", 1), ".mp3-1");
}

#[test]
fn partial_path_keeps_original_extension() {
    assert_eq!(
        partial_path(Path::new("/lib/x.mp3")),
        PathBuf::from("/lib/x.mp3.partial")
    );
    assert_eq!(
        partial_path(Path::new("/lib/README")),
        PathBuf::from("/lib/README.partial")
    );
}

#[tokio::test]
async fn same_filename_twice_never_overwrites() {
    let fx = fixture().await;
    let first = fx.source("one.mp3", b"first");
    let second = fx.source("two.mp3", b"second");
    fx.queue.enqueue(&first, "x.mp3", "/").await.unwrap();
    fx.queue.enqueue(&second, "x.mp3", "/").await.unwrap();

    let outcomes = fx.worker.drain().await.unwrap();

    assert_eq!(
        outcomes,
        vec![
            TaskOutcome::Copied(fx.library.join("x.mp3")),
            TaskOutcome::Copied(fx.library.join("x-1.mp3")),
        ]
    );
    assert_eq!(std::fs::read(fx.library.join("x.mp3")).unwrap(), b"first");
    assert_eq!(std::fs::read(fx.library.join("x-1.mp3")).unwrap(), b"second");
    assert!(fx.queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn copies_into_destination_subdirectory() {
    let fx = fixture().await;
    let token = fx.source("song.mp3", b"data");
    fx.queue.enqueue(&token, "song.mp3", "/Imports/2026").await.unwrap();

    fx.worker.drain().await.unwrap();

    assert_eq!(
        std::fs::read(fx.library.join("Imports/2026/song.mp3")).unwrap(),
        b"data"
    );
}

#[tokio::test]
async fn failure_stays_visible_until_retried() {
    let fx = fixture().await;
    let token = fx.source("gone.mp3", b"data");
    std::fs::remove_file(fx.sources.join("gone.mp3")).unwrap();
    let id = fx.queue.enqueue(&token, "gone.mp3", "/").await.unwrap();
    let mut rx = fx.queue.events().subscribe();

    let outcomes = fx.worker.drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [TaskOutcome::Failed(_)]));
    let task = fx.queue.catalog().get_task(id).await.unwrap().unwrap();
    assert!(matches!(task.state, TaskState::Error(ref message) if message.contains("gone.mp3")));
    assert!(
        drain(&mut rx)
            .iter()
            .any(|event| matches!(event, LibraryEvent::TaskFailed { id: failed, .. } if *failed == id))
    );
    assert!(fx.worker.drain().await.unwrap().is_empty());

    std::fs::write(fx.sources.join("gone.mp3"), b"back").unwrap();
    assert!(fx.queue.retry(id).await.unwrap());
    let outcomes = fx.worker.drain().await.unwrap();
    assert_eq!(outcomes, vec![TaskOutcome::Copied(fx.library.join("gone.mp3"))]);
    assert!(fx.queue.catalog().get_task(id).await.unwrap().is_none());
}

#[tokio::test]
async fn success_emits_started_finished_and_count() {
    let fx = fixture().await;
    let a = fx.source("a.mp3", b"a");
    let b = fx.source("b.mp3", b"b");
    fx.queue.enqueue(&a, "a.mp3", "/").await.unwrap();
    fx.queue.enqueue(&b, "b.mp3", "/").await.unwrap();
    let mut rx = fx.queue.events().subscribe();

    fx.worker.drain().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![
            LibraryEvent::TaskStarted { remaining: 2 },
            LibraryEvent::TaskFinished {
                remaining: 1,
                previous: 2
            },
            LibraryEvent::TaskCountChanged { count: 1 },
            LibraryEvent::TaskStarted { remaining: 1 },
            LibraryEvent::TaskFinished {
                remaining: 0,
                previous: 1
            },
            LibraryEvent::TaskCountChanged { count: 0 },
        ]
    );
}

#[tokio::test]
async fn running_task_at_restart_is_redone_from_scratch() {
    let fx = fixture().await;
    let token = fx.source("long.mp3", b"complete contents");
    let id = fx.queue.enqueue(&token, "long.mp3", "/").await.unwrap();
    fx.queue.catalog().mark_task_running(id).await.unwrap();
    std::fs::write(
        fx.library.join("long.mp3.partial"),
        b"stale half-written bytes that are longer",
    )
    .unwrap();

    assert!(fx.worker.drain().await.unwrap().is_empty());
    assert_eq!(fx.queue.recover_interrupted().await.unwrap(), 1);
    let outcomes = fx.worker.drain().await.unwrap();

    assert_eq!(outcomes, vec![TaskOutcome::Copied(fx.library.join("long.mp3"))]);
    assert_eq!(
        std::fs::read(fx.library.join("long.mp3")).unwrap(),
        b"complete contents"
    );
    assert!(!fx.library.join("long.mp3.partial").exists());
    assert!(fx.queue.list().await.unwrap().is_empty());
    assert!(fx.worker.drain().await.unwrap().is_empty());
}

#[tokio::test]
async fn run_forever_continues_past_failures_and_stops_on_cancel() {
    let fx = fixture().await;
    let cancel = CancellationToken::new();
    let handle = {
        let worker = fx.worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run_forever(cancel).await })
    };

    fx.queue
        .enqueue(b"not a token", "bad.mp3", "/")
        .await
        .unwrap();
    let good = fx.source("good.mp3", b"ok");
    fx.queue.enqueue(&good, "good.mp3", "/").await.unwrap();

    let target = fx.library.join("good.mp3");
    tokio::time::timeout(Duration::from_secs(5), async {
        while fx.queue.open_count().await.unwrap() > 0 || !target.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    let tasks = fx.queue.list().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].filename, "bad.mp3");
    assert!(matches!(tasks[0].state, TaskState::Error(_)));
}

#[tokio::test]
async fn crash_after_rename_reuses_the_recorded_name() {
    let fx = fixture().await;
    let token = fx.source("x.mp3", b"contents");
    let id = fx.queue.enqueue(&token, "x.mp3", "/").await.unwrap();
    fx.queue.catalog().mark_task_running(id).await.unwrap();
    fx.queue.catalog().set_task_target(id, "x.mp3").await.unwrap();
    std::fs::write(fx.library.join("x.mp3"), b"contents").unwrap();

    fx.queue.recover_interrupted().await.unwrap();
    let outcomes = fx.worker.drain().await.unwrap();

    assert_eq!(outcomes, vec![TaskOutcome::Copied(fx.library.join("x.mp3"))]);
    assert_eq!(std::fs::read(fx.library.join("x.mp3")).unwrap(), b"contents");
    assert!(!fx.library.join("x-1.mp3").exists());
    assert!(fx.queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn name_taken_during_copy_is_not_overwritten() {
    let fx = fixture().await;
    let token = fx.source("x.mp3", b"import");
    let id = fx.queue.enqueue(&token, "x.mp3", "/").await.unwrap();
    let task = fx.queue.catalog().get_task(id).await.unwrap().unwrap();
    let target = fx.worker.claim_destination(&task, &fx.library).await.unwrap();
    assert_eq!(target, fx.library.join("x.mp3"));

    let partial = partial_path(&target);
    std::fs::write(&partial, b"import").unwrap();
    std::fs::write(&target, b"someone else").unwrap();
    let placed = fx
        .worker
        .finalize(&task, &fx.library, &partial, target.clone(), false)
        .await
        .unwrap();

    assert_eq!(placed, fx.library.join("x-1.mp3"));
    assert_eq!(std::fs::read(&target).unwrap(), b"someone else");
    assert_eq!(std::fs::read(&placed).unwrap(), b"import");
    assert!(!partial.exists());
    let task = fx.queue.catalog().get_task(id).await.unwrap().unwrap();
    assert_eq!(task.target_name.as_deref(), Some("x-1.mp3"));
}
