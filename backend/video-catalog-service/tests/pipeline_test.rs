//! Full in-process pipeline: command service -> outbox -> processor ->
//! channel transport -> projection consumer -> read model.

use chrono::Utc;
use idempotent_consumer::{IdempotencyGuard, InMemoryProcessedEventStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use transactional_outbox::{OutboxProcessor, OutboxProcessorConfig, OutboxPublisher};
use uuid::Uuid;

use video_catalog_service::clock::SystemClock;
use video_catalog_service::consumers::{
    ChannelPublisher, ConsumerConfig, ProjectionApplier, ProjectionConsumer,
};
use video_catalog_service::db::{MemoryCatalog, MemoryProjectionStore, ProjectionStore};
use video_catalog_service::metrics::NoopReporter;
use video_catalog_service::models::{OverallStatus, ProjectionRow, StageStatus};
use video_catalog_service::services::{
    CreateVideoRequest, ProcessingStatusService, RequestContext, UpdateProcessingStatusRequest,
    UpdateVideoRequest, VideoCommandService,
};

type Consumer = ProjectionConsumer<InMemoryProcessedEventStore, MemoryProjectionStore>;

struct Pipeline {
    catalog: MemoryCatalog,
    projection: Arc<MemoryProjectionStore>,
    commands: Arc<VideoCommandService<MemoryCatalog>>,
    processor: Arc<OutboxProcessor<MemoryCatalog, ChannelPublisher>>,
    publisher: ChannelPublisher,
    consumer: Arc<Consumer>,
    shutdown: watch::Sender<bool>,
    consumer_task: tokio::task::JoinHandle<()>,
    ctx: RequestContext,
}

impl Pipeline {
    fn start(workers: usize) -> Self {
        let catalog = MemoryCatalog::new();
        let projection = Arc::new(MemoryProjectionStore::new());
        let commands = Arc::new(VideoCommandService::new(
            Arc::new(catalog.clone()),
            Arc::new(SystemClock),
            Arc::new(NoopReporter),
        ));

        let (publisher, deliveries) = ChannelPublisher::channel(256);
        let processor = Arc::new(OutboxProcessor::new(
            Arc::new(catalog.clone()),
            Arc::new(publisher.clone()),
            OutboxProcessorConfig {
                poll_interval: Duration::from_millis(10),
                base_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                workers,
                ..Default::default()
            },
        ));

        let consumer = Arc::new(ProjectionConsumer::new(
            IdempotencyGuard::new(InMemoryProcessedEventStore::new(), Duration::from_secs(3600)),
            ProjectionApplier::new(
                Arc::clone(&projection),
                Arc::new(SystemClock),
                Arc::new(NoopReporter),
            ),
            Arc::new(SystemClock),
            Arc::new(NoopReporter),
            ConsumerConfig {
                workers,
                redelivery_delay: Duration::from_millis(10),
                ..Default::default()
            },
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let consumer_task = tokio::spawn(Arc::clone(&consumer).run(deliveries, shutdown_rx));

        Self {
            catalog,
            projection,
            commands,
            processor,
            publisher,
            consumer,
            shutdown,
            consumer_task,
            ctx: RequestContext::generate(),
        }
    }

    async fn create(&self, title: &str) -> Uuid {
        self.commands
            .create_video(
                &self.ctx,
                CreateVideoRequest {
                    upload_user_id: Uuid::new_v4(),
                    title: title.to_string(),
                    raw_file_reference: "r".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .video_id
    }

    async fn rename(&self, video_id: Uuid, title: &str) {
        self.commands
            .update_video(
                &self.ctx,
                UpdateVideoRequest {
                    video_id,
                    title: Some(title.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    /// Poll the read model until `check` holds for the row of `video_id`.
    async fn wait_for_row(
        &self,
        video_id: Uuid,
        check: impl Fn(&ProjectionRow) -> bool,
    ) -> ProjectionRow {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(row) = self.projection.get(video_id).await.unwrap() {
                if check(&row) {
                    return row;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "projection for {video_id} never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn drain(&self) {
        while self.processor.process_batch().await.unwrap().published > 0 {}
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.consumer_task)
            .await
            .expect("consumer should stop on shutdown")
            .unwrap();
    }
}

#[tokio::test]
async fn test_create_then_media_ready_reaches_projection() {
    let pipeline = Pipeline::start(2);

    let video_id = pipeline.create("T").await;
    let ledger = pipeline.catalog.outbox_events();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].event_type, "video.created");

    pipeline.drain().await;
    let row = pipeline.wait_for_row(video_id, |_| true).await;
    assert_eq!(row.title, "T");
    assert_eq!(row.version, 1);
    assert_eq!(row.overall_status, OverallStatus::PendingUpload);

    let updated = ProcessingStatusService::new(Arc::clone(&pipeline.commands))
        .update_processing_status(
            &pipeline.ctx,
            UpdateProcessingStatusRequest {
                video_id,
                stage: "media".to_string(),
                new_status: "ready".to_string(),
                job_id: "j1".to_string(),
                emitted_at: Utc::now(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.media_status, StageStatus::Ready);
    assert_eq!(updated.overall_status, OverallStatus::Processing);

    pipeline.drain().await;
    let row = pipeline
        .wait_for_row(video_id, |row| row.media_status == StageStatus::Ready)
        .await;
    assert_eq!(row.title, "T");
    assert_eq!(row.analysis_status, StageStatus::Pending);
    assert_eq!(row.overall_status, OverallStatus::Processing);
    assert_eq!(row.version, updated.version);

    assert!(pipeline.catalog.outbox_events().iter().all(|e| e.is_published()));
    pipeline.stop().await;
}

#[tokio::test]
async fn test_republished_event_is_applied_once() {
    let pipeline = Pipeline::start(1);
    let video_id = pipeline.create("T").await;
    pipeline.drain().await;
    pipeline.wait_for_row(video_id, |_| true).await;

    // A row marked published may still be delivered again.
    let created = pipeline.catalog.outbox_events().remove(0);
    pipeline.publisher.publish(&created).await.unwrap();
    pipeline.rename(video_id, "Renamed").await;
    pipeline.drain().await;

    let row = pipeline
        .wait_for_row(video_id, |row| row.title == "Renamed")
        .await;
    assert!(row.version > 1);
    assert_eq!(pipeline.consumer.guard().store().len(), 2);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_backlog_converges_to_latest_state() {
    let pipeline = Pipeline::start(4);
    let mut videos = Vec::new();
    for i in 0..5 {
        let video_id = pipeline.create(&format!("video-{i}")).await;
        for n in 0..10 {
            pipeline.rename(video_id, &format!("video-{i}-rev-{n}")).await;
        }
        videos.push(video_id);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let processor = Arc::clone(&pipeline.processor);
    let processor_task = tokio::spawn(async move { processor.run(stop_rx).await });

    for (i, video_id) in videos.iter().enumerate() {
        let expected = pipeline.commands.get_video(*video_id).await.unwrap();
        let row = pipeline
            .wait_for_row(*video_id, |row| row.version == expected.version)
            .await;
        assert_eq!(row.title, format!("video-{i}-rev-9"));
    }

    stop_tx.send(true).unwrap();
    processor_task.await.unwrap().unwrap();
    assert!(pipeline.catalog.outbox_events().iter().all(|e| e.is_published()));
    pipeline.stop().await;
}

#[tokio::test]
async fn test_unreachable_consumer_reschedules_rows() {
    let catalog = MemoryCatalog::new();
    let commands = VideoCommandService::new(
        Arc::new(catalog.clone()),
        Arc::new(SystemClock),
        Arc::new(NoopReporter),
    );
    let (publisher, deliveries) = ChannelPublisher::channel(4);
    drop(deliveries);
    let processor = OutboxProcessor::new(
        Arc::new(catalog.clone()),
        Arc::new(publisher),
        OutboxProcessorConfig {
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        },
    );

    commands
        .create_video(
            &RequestContext::new(),
            CreateVideoRequest {
                upload_user_id: Uuid::new_v4(),
                title: "T".to_string(),
                raw_file_reference: "r".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = processor.process_batch().await.unwrap();
    assert_eq!((report.published, report.failed), (0, 1));

    let row = catalog.outbox_events().remove(0);
    assert!(!row.is_published());
    assert_eq!(row.delivery_attempts, 1);
    assert!(row.last_error.is_some());
    assert!(row.available_at > Utc::now());

    // Backed off: not due again yet.
    let report = processor.process_batch().await.unwrap();
    assert_eq!((report.published, report.failed), (0, 0));
}
