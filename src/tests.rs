#[cfg(test)]
mod integration_tests {
    use crate::testing::{temp_storage, test_worker, RecordingSessionPool, ScriptedCapturer};
    use crate::{
        apply_overrides, split_link_ids, ArchiveBackend, ArchiveError, ArchiveRoutine,
        ArchiveWorker, ArtifactKind, BackendKind, CaptureSettings, Cli, Commands, Config,
        DiscardReason, JobChannel, JobDispatcher, JobOptions, JobOutcome, Link, LinkId, LinkStore,
        MemoryJobChannel, MemoryLinkStore, Metrics, MockLinkStore, PollingBackend, QueueBackend,
        WorkerPool, WorkerPoolOptions, ARCHIVE_QUEUE,
    };
    use chrono::Utc;
    use clap::Parser;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn store_with(links: Vec<Link>) -> Arc<MemoryLinkStore> {
        let store = Arc::new(MemoryLinkStore::new());
        for link in links {
            store.insert(link);
        }
        store
    }

    fn queue_dispatcher(channel: Arc<MemoryJobChannel>) -> JobDispatcher {
        JobDispatcher::new(Arc::new(QueueBackend::new(
            channel,
            JobOptions::default(),
            Arc::new(Metrics::new()),
        )))
    }

    fn routine(
        worker: ArchiveWorker<RecordingSessionPool, ScriptedCapturer>,
        channel: Arc<MemoryJobChannel>,
    ) -> ArchiveRoutine<RecordingSessionPool, ScriptedCapturer> {
        ArchiveRoutine::new(0, Arc::new(worker), channel, Duration::from_millis(10))
    }

    fn invalid_inputs() -> Vec<Value> {
        vec![
            json!(0),
            json!(-1),
            json!("abc"),
            json!(""),
            json!(1.5),
            Value::Null,
            json!(false),
        ]
    }

    #[tokio::test]
    async fn test_invalid_ids_submit_nothing_in_queue_mode() {
        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());

        dispatcher.enqueue_archive_job(0).await;
        dispatcher.enqueue_archive_job(-7).await;
        for input in invalid_inputs() {
            dispatcher.enqueue_archive_job_value(&input).await;
        }

        assert!(channel.pending_payloads().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_ids_mutate_nothing_in_polling_mode() {
        let store = store_with(vec![Link::new(1, "https://example.com", 1, 1)]);
        let dispatcher = JobDispatcher::new(Arc::new(PollingBackend::new(
            store.clone(),
            Arc::new(Metrics::new()),
        )));

        dispatcher.enqueue_archive_job(0).await;
        for input in invalid_inputs() {
            dispatcher.enqueue_archive_job_value(&input).await;
        }

        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_polling_mode_resets_link_without_message() {
        let mut link = Link::new(5, "https://example.com", 1, 1);
        link.image = Some("archives/1/5.jpeg".to_string());
        link.pdf = Some("archives/1/5.pdf".to_string());
        link.preview = Some("archives/preview/1/5.jpeg".to_string());
        link.last_preserved = Some(Utc::now());
        link.index_version = Some(2);
        link.client_side = true;
        let store = store_with(vec![link]);

        let config = Config::default();
        let dispatcher = JobDispatcher::from_config(&config, store.clone(), Arc::new(Metrics::new()))
            .await
            .unwrap();

        assert!(!dispatcher.archive_queue_available());
        assert_eq!(dispatcher.backend_kind(), BackendKind::Polling);

        dispatcher.enqueue_archive_job(5).await;

        let link = store.get(5).unwrap();
        assert!(link.is_pending());
        assert_eq!(store.reset_count(), 1);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_polling_mode_missing_link_is_silent() {
        let store = store_with(Vec::new());
        let dispatcher = JobDispatcher::new(Arc::new(PollingBackend::new(
            store.clone(),
            Arc::new(Metrics::new()),
        )));

        dispatcher.enqueue_archive_job(404).await;
        assert!(store.get(404).is_none());
    }

    #[tokio::test]
    async fn test_queue_mode_submits_one_message_with_fixed_options() {
        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());
        assert!(dispatcher.archive_queue_available());

        dispatcher.enqueue_archive_job(42).await;

        assert_eq!(channel.pending_payloads().await, vec![json!({ "linkId": 42 })]);
        assert_eq!(channel.options_of(1).await, Some(JobOptions::default()));
        let delivery = channel.reserve(ARCHIVE_QUEUE).await.unwrap().unwrap();
        assert_eq!(delivery.name, "archive");
        assert_eq!(delivery.queue, "archive");
        assert_eq!(
            serde_json::to_value(&delivery.options).unwrap(),
            json!({
                "attempts": 3,
                "backoff": { "type": "exponential", "delay": 1000 },
                "removeOnComplete": true
            })
        );
    }

    #[tokio::test]
    async fn test_queue_mode_leaves_preserved_fields_untouched() {
        let store = Arc::new(MemoryLinkStore::new());
        let mut link = Link::new(5, "https://example.com", 1, 1);
        link.image = Some("archives/1/5.png".to_string());
        link.index_version = Some(3);
        link.last_preserved = Some(Utc::now());
        store.insert(link);

        let config = Config {
            broker_url: Some("memory://".to_string()),
            ..Default::default()
        };
        let dispatcher = JobDispatcher::from_config(&config, store.clone(), Arc::new(Metrics::new()))
            .await
            .unwrap();
        dispatcher.enqueue_archive_job(5).await;

        assert_eq!(dispatcher.backend_kind(), BackendKind::Queue);
        assert_eq!(store.reset_count(), 0);
        let stored = store.get(5).unwrap();
        assert_eq!(stored.image.as_deref(), Some("archives/1/5.png"));
        assert_eq!(stored.index_version, Some(3));
        assert!(stored.last_preserved.is_some());
    }

    #[tokio::test]
    async fn test_numeric_strings_are_accepted() {
        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());

        dispatcher.enqueue_archive_job_value(&json!("17")).await;
        dispatcher.enqueue_archive_job_value(&json!(18.0)).await;

        assert_eq!(
            channel.pending_payloads().await,
            vec![json!({ "linkId": 17 }), json!({ "linkId": 18 })]
        );
    }

    #[tokio::test]
    async fn test_backend_selected_from_config() {
        let store: Arc<dyn LinkStore> = Arc::new(MemoryLinkStore::new());

        let config = Config {
            broker_url: Some("memory://".to_string()),
            ..Default::default()
        };
        let dispatcher = JobDispatcher::from_config(&config, store.clone(), Arc::new(Metrics::new()))
            .await
            .unwrap();
        assert_eq!(dispatcher.backend_kind(), BackendKind::Queue);

        let config = Config {
            broker_url: Some("   ".to_string()),
            ..Default::default()
        };
        let dispatcher = JobDispatcher::from_config(&config, store.clone(), Arc::new(Metrics::new()))
            .await
            .unwrap();
        assert_eq!(dispatcher.backend_kind(), BackendKind::Polling);

        let config = Config {
            broker_url: Some("redis://localhost:6379".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            JobDispatcher::from_config(&config, store, Arc::new(Metrics::new())).await,
            Err(ArchiveError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_converges() {
        let store = store_with(vec![Link::new(42, "https://example.com", 1, 1)]);
        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());

        dispatcher.enqueue_archive_job(42).await;
        dispatcher.enqueue_archive_job(42).await;
        assert_eq!(channel.pending_payloads().await.len(), 2);

        let pool = Arc::new(RecordingSessionPool::new());
        let routine = routine(
            test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new())),
            channel.clone(),
        );
        assert!(routine.run_next().await.unwrap().is_some());
        assert!(routine.run_next().await.unwrap().is_some());
        assert!(routine.run_next().await.unwrap().is_none());

        let link = store.get(42).unwrap();
        for kind in [
            ArtifactKind::Image,
            ArtifactKind::Pdf,
            ArtifactKind::Readable,
            ArtifactKind::Monolith,
            ArtifactKind::Preview,
        ] {
            assert!(link.artifact(kind).is_some(), "{kind} missing");
        }
        assert_eq!(link.index_version, Some(2));
        assert_eq!(pool.acquired(), 2);
        assert_eq!(pool.released(), 2);
    }

    #[tokio::test]
    async fn test_session_released_once_when_every_kind_fails() {
        let store = store_with(vec![Link::new(3, "https://example.com", 1, 1)]);
        let pool = Arc::new(RecordingSessionPool::new());
        let worker = test_worker(
            store.clone(),
            pool.clone(),
            Arc::new(ScriptedCapturer::new().fail_all()),
        );

        let outcome = worker.process(&json!({ "linkId": 3 })).await.unwrap();

        let report = outcome.report().unwrap();
        assert!(report.captured.is_empty());
        assert_eq!(report.failed.len(), 5);
        assert_eq!(pool.acquired(), 1);
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.released_ids(), vec![1]);

        let link = store.get(3).unwrap();
        assert!(link.image.is_none());
        assert!(link.last_preserved.is_some());
        assert_eq!(link.index_version, Some(1));
    }

    #[tokio::test]
    async fn test_pdf_failure_still_completes() {
        let store = store_with(vec![Link::new(4, "https://example.com", 9, 1)]);
        let channel = Arc::new(MemoryJobChannel::new());
        queue_dispatcher(channel.clone()).enqueue_archive_job(4).await;

        let pool = Arc::new(RecordingSessionPool::new());
        let capturer = Arc::new(ScriptedCapturer::new().fail(ArtifactKind::Pdf));
        let routine = routine(test_worker(store.clone(), pool.clone(), capturer), channel.clone());

        routine.run_next().await.unwrap();

        let link = store.get(4).unwrap();
        assert!(link.pdf.is_none());
        assert_eq!(link.image.as_deref(), Some("archives/9/4.png"));
        assert_eq!(link.readable.as_deref(), Some("archives/9/4_readability.json"));
        assert_eq!(link.monolith.as_deref(), Some("archives/9/4.html"));

        let counts = channel.counts(ARCHIVE_QUEUE).await.unwrap();
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.delayed, 0);
        assert_eq!(routine.get_stats().processed_count, 1);
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_missing_link_never_acquires_a_session() {
        let store = store_with(Vec::new());
        let pool = Arc::new(RecordingSessionPool::new());
        let worker = test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new()));

        let outcome = worker.process(&json!({ "linkId": 77 })).await.unwrap();

        assert!(matches!(
            outcome,
            JobOutcome::Discarded(DiscardReason::LinkNotFound(id)) if id.get() == 77
        ));
        assert_eq!(pool.acquired(), 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_link_deleted_after_enqueue_is_discarded() {
        let store = store_with(vec![Link::new(31, "https://example.com", 1, 1)]);
        let channel = Arc::new(MemoryJobChannel::new());
        queue_dispatcher(channel.clone()).enqueue_archive_job(31).await;
        store.remove(31);

        let pool = Arc::new(RecordingSessionPool::new());
        let routine = routine(
            test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new())),
            channel.clone(),
        );
        routine.run_next().await.unwrap();

        assert_eq!(routine.get_stats().discarded_count, 1);
        assert_eq!(routine.get_stats().error_count, 0);
        assert_eq!(pool.acquired(), 0);
        assert!(channel.failed_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded_and_completed() {
        let store = store_with(Vec::new());
        let channel = Arc::new(MemoryJobChannel::new());
        channel
            .push(ARCHIVE_QUEUE, "archive", json!({ "link": 1 }), &JobOptions::default())
            .await
            .unwrap();

        let pool = Arc::new(RecordingSessionPool::new());
        let routine = routine(
            test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new())),
            channel.clone(),
        );
        routine.run_next().await.unwrap();

        assert_eq!(
            channel.counts(ARCHIVE_QUEUE).await.unwrap(),
            crate::QueueCounts::default()
        );
        assert_eq!(routine.get_stats().discarded_count, 1);
        assert_eq!(pool.acquired(), 0);
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_archive_scenario_for_link_42() {
        let mut link = Link::new(42, "https://example.com/article", 1, 1);
        link.pdf = Some("archives/1/42.pdf".to_string());
        link.index_version = Some(3);
        link.client_side = true;
        let store = store_with(vec![link]);

        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());
        dispatcher.enqueue_archive_job(42).await;

        let capturer = Arc::new(
            ScriptedCapturer::new()
                .fail(ArtifactKind::Pdf)
                .fail(ArtifactKind::Monolith),
        );
        let worker = ArchiveWorker::new(
            store.clone(),
            Arc::new(RecordingSessionPool::new()),
            capturer.clone(),
            temp_storage(),
            CaptureSettings {
                preview: false,
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        );

        let delivery = channel.reserve(ARCHIVE_QUEUE).await.unwrap().unwrap();
        assert_eq!(delivery.payload, json!({ "linkId": 42 }));

        let before = Utc::now();
        let outcome = worker.process(&delivery.payload).await.unwrap();
        let after = Utc::now();
        channel.complete(&delivery).await.unwrap();

        assert!(!outcome.is_discarded());
        let link = store.get(42).unwrap();
        assert_eq!(link.image.as_deref(), Some("archives/1/42.png"));
        assert_eq!(link.readable.as_deref(), Some("archives/1/42_readability.json"));
        assert_eq!(link.pdf.as_deref(), Some("archives/1/42.pdf"));
        assert!(link.monolith.is_none());
        assert!(link.preview.is_none());
        let preserved = link.last_preserved.unwrap();
        assert!(preserved >= before && preserved <= after);
        assert_eq!(link.index_version, Some(4));
        assert!(!link.client_side);

        let mut calls = capturer.calls();
        calls.sort_by_key(|kind| kind.as_str());
        assert_eq!(calls.len(), 4);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_retried_with_backoff() {
        let store = store_with(vec![Link::new(6, "https://example.com", 1, 1)]);
        let channel = Arc::new(MemoryJobChannel::new());
        queue_dispatcher(channel.clone()).enqueue_archive_job(6).await;

        let pool = Arc::new(RecordingSessionPool::failing());
        let worker = test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new()));

        let error = worker.process(&json!({ "linkId": 6 })).await.unwrap_err();
        assert!(matches!(error, ArchiveError::ResourceUnavailable(_)));
        assert!(error.is_retryable());

        let routine = routine(worker, channel.clone());
        routine.run_next().await.unwrap();
        assert_eq!(channel.counts(ARCHIVE_QUEUE).await.unwrap().delayed, 1);

        for _ in 0..2 {
            channel.promote_delayed().await;
            routine.run_next().await.unwrap();
        }

        let failed = channel.failed_jobs().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.attempts_made, 3);
        assert_eq!(store.commit_count(), 0);
        assert_eq!(routine.get_stats().error_count, 3);
    }

    #[tokio::test]
    async fn test_persistence_failure_releases_session_and_retries() {
        let link = Link::new(11, "https://example.com", 1, 1);
        let mut store = MockLinkStore::new();
        store
            .expect_find_link()
            .returning(move |_| Ok(Some(link.clone())));
        store
            .expect_commit_preservation()
            .times(1)
            .returning(|_, _, _| Err(ArchiveError::Persistence("connection reset".to_string())));

        let pool = Arc::new(RecordingSessionPool::new());
        let worker = test_worker(Arc::new(store), pool.clone(), Arc::new(ScriptedCapturer::new()));

        let error = worker.process(&json!({ "linkId": 11 })).await.unwrap_err();
        assert!(matches!(error, ArchiveError::Persistence(_)));
        assert!(error.is_retryable());
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_completion() {
        let store = store_with(vec![Link::new(12, "https://example.com", 1, 1)]);
        let pool = Arc::new(RecordingSessionPool::failing_release());
        let worker = test_worker(store.clone(), pool.clone(), Arc::new(ScriptedCapturer::new()));

        let outcome = worker.process(&json!({ "linkId": 12 })).await.unwrap();

        assert!(outcome.report().unwrap().persisted);
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_retried() {
        let mut store = MockLinkStore::new();
        store
            .expect_find_link()
            .returning(|_| panic!("store driver crashed"));

        let channel = Arc::new(MemoryJobChannel::new());
        queue_dispatcher(channel.clone()).enqueue_archive_job(13).await;

        let pool = Arc::new(RecordingSessionPool::new());
        let routine = routine(
            test_worker(Arc::new(store), pool.clone(), Arc::new(ScriptedCapturer::new())),
            channel.clone(),
        );
        routine.run_next().await.unwrap();

        assert_eq!(channel.counts(ARCHIVE_QUEUE).await.unwrap().delayed, 1);
        assert_eq!(pool.acquired(), 0);
    }

    #[tokio::test]
    async fn test_link_deleted_mid_job_completes() {
        let link = Link::new(14, "https://example.com", 1, 1);
        let mut store = MockLinkStore::new();
        store
            .expect_find_link()
            .returning(move |_| Ok(Some(link.clone())));
        store
            .expect_commit_preservation()
            .returning(|_, _, _| Ok(false));

        let worker = test_worker(
            Arc::new(store),
            Arc::new(RecordingSessionPool::new()),
            Arc::new(ScriptedCapturer::new()),
        );
        let outcome = worker.process(&json!({ "linkId": 14 })).await.unwrap();

        assert!(!outcome.report().unwrap().persisted);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue_and_stops() {
        let store = store_with(vec![
            Link::new(21, "https://example.com/a", 1, 1),
            Link::new(22, "https://example.com/b", 1, 1),
        ]);
        let channel = Arc::new(MemoryJobChannel::new());
        let dispatcher = queue_dispatcher(channel.clone());
        dispatcher.enqueue_archive_job(21).await;
        dispatcher.enqueue_archive_job(22).await;

        let pool = Arc::new(RecordingSessionPool::new());
        let worker = Arc::new(test_worker(
            store.clone(),
            pool.clone(),
            Arc::new(ScriptedCapturer::new()),
        ));
        let workers = WorkerPool::start(
            worker,
            channel.clone(),
            WorkerPoolOptions {
                workers: 2,
                poll_interval: Duration::from_millis(10),
            },
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while workers.total_processed() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(workers.total_errors(), 0);
        workers.shutdown().await;

        assert_eq!(pool.released(), 2);
        assert!(store.get(21).unwrap().last_preserved.is_some());
        assert!(store.get(22).unwrap().last_preserved.is_some());
    }

    #[tokio::test]
    async fn test_queue_backend_reports_kind() {
        let backend = QueueBackend::new(
            Arc::new(MemoryJobChannel::new()),
            JobOptions::default(),
            Arc::new(Metrics::new()),
        );
        assert_eq!(backend.kind(), BackendKind::Queue);
        backend.enqueue(LinkId::new(1).unwrap()).await.unwrap();
    }

    #[test]
    fn test_cli_flags_override_config() {
        let args = Cli::try_parse_from([
            "link-archiver",
            "--broker-url",
            "memory://",
            "--workers",
            "6",
            "enqueue",
            "42",
            "abc",
        ])
        .unwrap();

        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert!(config.broker_configured());
        assert_eq!(config.workers, 6);
        assert!(matches!(
            args.command,
            Commands::Enqueue { ref link_ids } if link_ids == &vec!["42".to_string(), "abc".to_string()]
        ));
    }

    #[test]
    fn test_enqueue_counts_only_valid_ids() {
        let raw: Vec<String> = ["42", "abc", " 7 ", "0", "-3", "9223372036854775808"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let (valid, invalid) = split_link_ids(&raw);

        assert_eq!(valid, vec![LinkId::new(42).unwrap(), LinkId::new(7).unwrap()]);
        assert_eq!(invalid, vec!["abc", "0", "-3", "9223372036854775808"]);
    }

    #[test]
    fn test_cli_requires_link_ids() {
        assert!(Cli::try_parse_from(["link-archiver", "enqueue"]).is_err());
        assert!(Cli::try_parse_from(["link-archiver", "worker"]).is_ok());
    }

    #[test]
    fn test_error_retryable() {
        assert!(ArchiveError::ResourceUnavailable("test".to_string()).is_retryable());
        assert!(ArchiveError::Persistence("test".to_string()).is_retryable());
        assert!(!ArchiveError::InvalidInput("test".to_string()).is_retryable());
        assert!(!ArchiveError::NotFound(1).is_retryable());
        assert!(!ArchiveError::capture(ArtifactKind::Pdf, "test").is_retryable());
        assert!(!ArchiveError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ArchiveError::SessionRelease("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_severity() {
        use crate::ErrorSeverity;

        assert_eq!(ArchiveError::InvalidInput("test".to_string()).severity(), ErrorSeverity::Low);
        assert_eq!(ArchiveError::NotFound(1).severity(), ErrorSeverity::Low);
        assert_eq!(ArchiveError::Persistence("test".to_string()).severity(), ErrorSeverity::High);
        assert_eq!(
            ArchiveError::Configuration("test".to_string()).severity(),
            ErrorSeverity::Critical
        );
    }
}
