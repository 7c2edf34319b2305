/// Write-side services.
///
/// [`VideoCommandService`] owns the transaction for every mutation; the
/// stage services check their preconditions against the stored aggregate
/// and delegate the write to it with the loaded version as the expected one.
pub mod ai_attributes;
pub mod context;
pub mod media_info;
pub mod processing;
pub mod videos;
pub mod visibility;

pub use ai_attributes::{AiAttributesService, UpdateAiAttributesRequest};
pub use context::RequestContext;
pub use media_info::{MediaInfoService, UpdateMediaInfoRequest};
pub use processing::{compute_overall_status, ProcessingStatusService, UpdateProcessingStatusRequest};
pub use videos::{
    CreateVideoRequest, DeleteVideoRequest, EventRef, UpdateVideoRequest, VideoCommandService,
    VideoCreated, VideoDeleted, VideoUpdated, DEFAULT_COMMAND_TIMEOUT,
};
pub use visibility::{UpdateVisibilityRequest, VisibilityService};
