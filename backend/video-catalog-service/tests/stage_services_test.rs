//! Stage and lifecycle services: processing status, media info, AI
//! attributes and visibility.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use video_catalog_service::clock::SystemClock;
use video_catalog_service::consumers::{Delivery, InboundEvent};
use video_catalog_service::db::MemoryCatalog;
use video_catalog_service::events::{
    EventKind, VIDEO_AI_ENRICHED, VIDEO_MEDIA_READY, VIDEO_PROCESSING_FAILED, VIDEO_UPDATED,
    VIDEO_VISIBILITY_CHANGED,
};
use video_catalog_service::metrics::NoopReporter;
use video_catalog_service::models::{OverallStatus, Stage, StageStatus};
use video_catalog_service::services::{
    AiAttributesService, CreateVideoRequest, MediaInfoService, ProcessingStatusService,
    RequestContext, UpdateAiAttributesRequest, UpdateMediaInfoRequest,
    UpdateProcessingStatusRequest, UpdateVisibilityRequest, VideoCommandService, VideoUpdated,
    VisibilityService,
};
use video_catalog_service::{AppError, ErrorKind};

struct Harness {
    store: MemoryCatalog,
    commands: Arc<VideoCommandService<MemoryCatalog>>,
    processing: ProcessingStatusService<MemoryCatalog>,
    media: MediaInfoService<MemoryCatalog>,
    ai: AiAttributesService<MemoryCatalog>,
    visibility: VisibilityService<MemoryCatalog>,
    ctx: RequestContext,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryCatalog::new();
        let commands = Arc::new(VideoCommandService::new(
            Arc::new(store.clone()),
            Arc::new(SystemClock),
            Arc::new(NoopReporter),
        ));
        Self {
            store,
            processing: ProcessingStatusService::new(Arc::clone(&commands)),
            media: MediaInfoService::new(Arc::clone(&commands)),
            ai: AiAttributesService::new(Arc::clone(&commands)),
            visibility: VisibilityService::new(Arc::clone(&commands)),
            commands,
            ctx: RequestContext::generate(),
        }
    }

    async fn create(&self) -> Uuid {
        self.commands
            .create_video(
                &self.ctx,
                CreateVideoRequest {
                    upload_user_id: Uuid::new_v4(),
                    title: "T".to_string(),
                    raw_file_reference: "r".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("create should succeed")
            .video_id
    }

    async fn stage(
        &self,
        video_id: Uuid,
        stage: &str,
        new_status: &str,
        job_id: &str,
        emitted_at: DateTime<Utc>,
    ) -> Result<VideoUpdated, AppError> {
        self.processing
            .update_processing_status(
                &self.ctx,
                UpdateProcessingStatusRequest {
                    video_id,
                    stage: stage.to_string(),
                    new_status: new_status.to_string(),
                    job_id: job_id.to_string(),
                    emitted_at,
                    ..Default::default()
                },
            )
            .await
    }

    fn event_types(&self) -> Vec<String> {
        self.store
            .outbox_events()
            .into_iter()
            .map(|row| row.event_type)
            .collect()
    }

    fn last_event(&self) -> InboundEvent {
        let rows = self.store.outbox_events();
        let row = rows.last().expect("ledger should not be empty");
        InboundEvent::decode(&Delivery::from_outbox(row), Utc::now()).unwrap()
    }
}

#[tokio::test]
async fn test_expected_status_mismatch_is_conflict_without_mutation() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t1 = Utc::now();

    h.stage(video_id, "media", "processing", "j1", t1).await.unwrap();
    h.stage(video_id, "media", "ready", "j1", t1 + ChronoDuration::seconds(1))
        .await
        .unwrap();
    let before = h.commands.get_video(video_id).await.unwrap();
    let rows_before = h.store.outbox_events().len();

    let err = h
        .processing
        .update_processing_status(
            &h.ctx,
            UpdateProcessingStatusRequest {
                video_id,
                stage: "media".to_string(),
                expected_status: Some("processing".to_string()),
                new_status: "ready".to_string(),
                job_id: "j1".to_string(),
                emitted_at: t1 + ChronoDuration::seconds(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.store.outbox_events().len(), rows_before);
    assert_eq!(h.commands.get_video(video_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_unknown_stage_or_status_is_validation() {
    let h = Harness::new();
    let video_id = h.create().await;

    let err = h.stage(video_id, "audio", "ready", "j1", Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.stage(video_id, "media", "done", "j1", Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.stage(video_id, "media", "ready", "", Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_stale_report_is_rejected() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t2 = Utc::now();

    h.stage(video_id, "analysis", "processing", "j1", t2).await.unwrap();
    let err = h
        .stage(video_id, "analysis", "ready", "j1", t2 - ChronoDuration::seconds(5))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(video.analysis_status, StageStatus::Processing);
}

#[tokio::test]
async fn test_other_job_must_advance_emitted_at() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t1 = Utc::now();

    h.stage(video_id, "media", "processing", "job-new", t1).await.unwrap();

    // Same instant from a different job does not take the stage over.
    let err = h.stage(video_id, "media", "ready", "job-old", t1).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let later = h
        .stage(video_id, "media", "ready", "job-next", t1 + ChronoDuration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(later.media_status, StageStatus::Ready);

    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(video.stage_job_id(Stage::Media), Some("job-next"));
}

#[tokio::test]
async fn test_overall_status_follows_stages() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t = Utc::now();

    let media_ready = h.stage(video_id, "media", "ready", "m1", t).await.unwrap();
    assert_eq!(media_ready.media_status, StageStatus::Ready);
    assert_eq!(media_ready.analysis_status, StageStatus::Pending);
    assert_eq!(media_ready.overall_status, OverallStatus::Processing);

    let both_ready = h.stage(video_id, "analysis", "ready", "a1", t).await.unwrap();
    assert_eq!(both_ready.overall_status, OverallStatus::Ready);
}

#[tokio::test]
async fn test_new_failure_emits_update_and_failure_events() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t = Utc::now();

    let failed = h
        .processing
        .update_processing_status(
            &h.ctx,
            UpdateProcessingStatusRequest {
                video_id,
                stage: "analysis".to_string(),
                new_status: "failed".to_string(),
                job_id: "a1".to_string(),
                emitted_at: t,
                error_message: Some("model timed out".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(failed.overall_status, OverallStatus::Failed);
    let failure_event = failed.failure_event.clone().expect("failure event expected");
    assert_eq!(failure_event.event_type, VIDEO_PROCESSING_FAILED);
    assert!(failure_event.version > failed.event.version);
    assert_eq!(failed.version, failure_event.version);

    assert_eq!(
        h.event_types(),
        vec!["video.created", VIDEO_UPDATED, VIDEO_PROCESSING_FAILED]
    );
    match h.last_event().kind {
        Some(EventKind::ProcessingFailed {
            stage,
            job_id,
            error_message,
        }) => {
            assert_eq!(stage, Stage::Analysis);
            assert_eq!(job_id.as_deref(), Some("a1"));
            assert_eq!(error_message.as_deref(), Some("model timed out"));
        }
        other => panic!("expected processing_failed, got {other:?}"),
    }

    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(video.error_message.as_deref(), Some("model timed out"));

    // Failing an already failed stage is a plain update.
    let again = h
        .stage(video_id, "analysis", "failed", "a2", t + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert!(again.failure_event.is_none());
    assert_eq!(h.event_types().len(), 4);
}

#[tokio::test]
async fn test_retry_after_failure_recovers_to_processing() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t = Utc::now();

    h.stage(video_id, "media", "failed", "m1", t).await.unwrap();
    let retried = h
        .stage(video_id, "media", "processing", "m2", t + ChronoDuration::seconds(1))
        .await
        .unwrap();

    assert_eq!(retried.overall_status, OverallStatus::Processing);
    let video = h.commands.get_video(video_id).await.unwrap();
    assert!(video.error_message.is_none());
}

#[tokio::test]
async fn test_media_info_emits_media_ready_on_first_ready() {
    let h = Harness::new();
    let video_id = h.create().await;
    let t = Utc::now();

    let updated = h
        .media
        .update_media_info(
            &h.ctx,
            UpdateMediaInfoRequest {
                video_id,
                duration_seconds: Some(93),
                resolution: Some("1920x1080".to_string()),
                bitrate_kbps: Some(4500),
                playlist_url: Some("https://cdn.example/v/master.m3u8".to_string()),
                media_status: Some("ready".to_string()),
                job_id: Some("m1".to_string()),
                emitted_at: Some(t),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.event.event_type, VIDEO_MEDIA_READY);
    assert_eq!(updated.media_status, StageStatus::Ready);
    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(video.duration_seconds, Some(93));
    assert_eq!(video.resolution.as_deref(), Some("1920x1080"));
    assert_eq!(video.stage_job_id(Stage::Media), Some("m1"));

    let thumb = h
        .media
        .update_media_info(
            &h.ctx,
            UpdateMediaInfoRequest {
                video_id,
                thumbnail_url: Some("https://cdn.example/v/thumb.jpg".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(thumb.event.event_type, VIDEO_UPDATED);
}

#[tokio::test]
async fn test_media_info_input_rules() {
    let h = Harness::new();
    let video_id = h.create().await;

    let empty = h
        .media
        .update_media_info(
            &h.ctx,
            UpdateMediaInfoRequest {
                video_id,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);

    let half_job = h
        .media
        .update_media_info(
            &h.ctx,
            UpdateMediaInfoRequest {
                video_id,
                resolution: Some("720p".to_string()),
                job_id: Some("m1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(half_job.kind(), ErrorKind::Validation);

    let negative = h
        .media
        .update_media_info(
            &h.ctx,
            UpdateMediaInfoRequest {
                video_id,
                bitrate_kbps: Some(-5),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(negative.kind(), ErrorKind::Validation);
    assert_eq!(h.store.outbox_events().len(), 1);
}

#[tokio::test]
async fn test_ai_attributes_enrich_and_normalize_tags() {
    let h = Harness::new();
    let video_id = h.create().await;

    let enriched = h
        .ai
        .update_ai_attributes(
            &h.ctx,
            UpdateAiAttributesRequest {
                video_id,
                difficulty: Some("intermediate".to_string()),
                summary: Some("Ownership and borrowing".to_string()),
                tags: Some(vec![" rust ".to_string(), "rust".to_string(), "memory".to_string()]),
                analysis_status: Some("ready".to_string()),
                job_id: Some("a1".to_string()),
                emitted_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(enriched.event.event_type, VIDEO_AI_ENRICHED);
    assert_eq!(enriched.analysis_status, StageStatus::Ready);
    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(
        video.tags,
        Some(vec!["rust".to_string(), "memory".to_string()])
    );
    assert_eq!(video.difficulty.as_deref(), Some("intermediate"));

    let blank = h
        .ai
        .update_ai_attributes(
            &h.ctx,
            UpdateAiAttributesRequest {
                video_id,
                tags: Some(vec!["  ".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(blank.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_visibility_transitions() {
    let h = Harness::new();
    let video_id = h.create().await;
    let publish = || UpdateVisibilityRequest {
        video_id,
        target: "published".to_string(),
        ..Default::default()
    };

    let not_ready = h.visibility.update_visibility(&h.ctx, publish()).await.unwrap_err();
    assert!(matches!(not_ready, AppError::Conflict(_)));

    let t = Utc::now();
    h.stage(video_id, "media", "ready", "m1", t).await.unwrap();
    h.stage(video_id, "analysis", "ready", "a1", t).await.unwrap();

    let published = h.visibility.update_visibility(&h.ctx, publish()).await.unwrap();
    assert_eq!(published.overall_status, OverallStatus::Published);
    assert_eq!(published.event.event_type, VIDEO_VISIBILITY_CHANGED);

    let rows_before = h.store.outbox_events().len();
    let repeat = h.visibility.update_visibility(&h.ctx, publish()).await.unwrap_err();
    assert!(matches!(repeat, AppError::Conflict(_)));
    assert_eq!(h.store.outbox_events().len(), rows_before);

    let rejected = h
        .visibility
        .update_visibility(
            &h.ctx,
            UpdateVisibilityRequest {
                video_id,
                target: "rejected".to_string(),
                reason: Some("community guidelines".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.overall_status, OverallStatus::Rejected);
    let video = h.commands.get_video(video_id).await.unwrap();
    assert_eq!(video.error_message.as_deref(), Some("community guidelines"));

    let invalid = h
        .visibility
        .update_visibility(
            &h.ctx,
            UpdateVisibilityRequest {
                video_id,
                target: "ready".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(invalid.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_stage_services_report_missing_video() {
    let h = Harness::new();
    let err = h
        .stage(Uuid::new_v4(), "media", "ready", "m1", Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
