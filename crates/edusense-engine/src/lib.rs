//! edusense-engine: attendance from lecture videos and bulk face registration.
//!
//! Both pipelines run as background tasks on a bounded worker pool and share
//! one face model handle and one store, passed in explicitly at startup.

pub mod attendance;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity_key;
pub mod registration;
pub mod staged;
pub mod store;
pub mod tasks;

pub use attendance::{AttendanceAggregator, AttendancePolicy, SessionPipeline, SessionReport, SessionTally, TallyStatus};
pub use config::{BusKind, Config, ConfigError};
pub use engine::{Engine, EngineDeps};
pub use error::{ErrorCategory, PipelineError, PipelineFailure};
pub use identity_key::{IdentityKey, IdentityKeyExtractor, KeyStrategy};
pub use registration::{BulkRegistrar, FailureReason, OutcomeStatus, RegistrationOutcome, RegistrationSummary};
pub use staged::StagedFile;
pub use store::{AttendanceStore, SqliteStore, StoreError, UpsertAction};
pub use tasks::{CancelToken, Retention, TaskContext, TaskId, TaskKind, TaskManager, TaskOutput, TaskSnapshot, TaskStatus};
