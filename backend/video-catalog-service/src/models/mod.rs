/// Data structures for the video catalog: the write-side aggregate, the
/// sparse changeset carried by update events, and the read-model row.
mod changes;
mod patch;
mod projection;
mod status;
mod video;

pub use changes::VideoChanges;
pub use patch::Patch;
pub use projection::ProjectionRow;
pub use status::{OverallStatus, ParseEnumError, Stage, StageStatus};
pub use video::{VideoAggregate, VideoSnapshot};
