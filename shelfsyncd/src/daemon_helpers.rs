/// Queues copy tasks for local files into the library root. Returns the new task ids.
pub async fn enqueue_imports(
    queue: &CopyTaskQueue,
    sources: &[PathBuf],
    destination_dir: &str,
) -> anyhow::Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(sources.len());
    for source in sources {
        let token = import_token(source).await?;
        let filename = token
            .file_name()
            .with_context(|| format!("{source:?} has no file name"))?;
        let id = queue
            .enqueue(&token.serialize(), &filename, destination_dir)
            .await
            .with_context(|| format!("failed to queue {source:?}"))?;
        ids.push(id);
    }
    Ok(ids)
}

async fn import_token(source: &Path) -> anyhow::Result<PathToken> {
    let absolute = tokio::fs::canonicalize(source)
        .await
        .with_context(|| format!("cannot access {source:?}"))?;
    PathToken::new(absolute).with_context(|| format!("invalid import source {source:?}"))
}

async fn run_duplicate_sweeps(
    detector: DuplicateDetector,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if let Err(err) = detector.scan_for_duplicates().await {
            warn!(error = %err, "duplicate sweep failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn log_events(mut rx: Receiver<LibraryEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => debug!(event = %event_json(&event), "library event"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn event_json(event: &LibraryEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| format!("{event:?}"))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
