//! Engagement sequence engine: advances leads through ordered sequence steps
//! on a timer, spends one credit per executed step, and reacts to replies,
//! temperature changes, replenishments and cancellations.

pub mod deps;
pub mod events;
pub mod executor;
pub mod ingestor;
pub mod journal;
pub mod ledger;
pub mod leads;
pub mod locks;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod sequencer;
pub mod sequences;

pub use deps::{MemoryDeps, SequencerDeps};
pub use events::EngagementEvent;
pub use executor::{
    ChannelExecutor, DeliveryChannel, DeliveryError, ExecutionResult, StepAction, StepContext,
    StepExecutor,
};
pub use ingestor::{EventIngestor, IngestOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig, TickOutcome, TickReport};
pub use sequencer::Sequencer;
