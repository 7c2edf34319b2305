/// Projection side of the pipeline.
///
/// Outbox rows reach the consumer as [`Delivery`] messages, are decoded into
/// [`InboundEvent`]s, deduplicated by event id and applied to the read model.
pub mod decode;
pub mod projection;
pub mod runner;
pub mod transport;

pub use decode::{Delivery, InboundEvent, ProjectionError};
pub use projection::{ApplyOutcome, ProjectionApplier, SkipReason};
pub use runner::{run_dedup_cleanup, ConsumerConfig, DeliveryOutcome, ProjectionConsumer};
pub use transport::ChannelPublisher;
