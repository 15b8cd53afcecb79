pub mod command;
pub mod config;
pub mod desired;
pub mod enforcer;
pub mod error;
pub mod models;
pub mod recording;
pub mod schedule;
pub mod store;
pub mod supervisor;

pub use command::{BuildError, BuildResult, CommandBuilder, JobCommand};
pub use config::{load_config, MediaLayout, ShiftcastConfig};
pub use desired::{compute_desired, DesiredJob, DesiredState};
pub use enforcer::{EnforcerLoop, TickReport};
pub use error::{ConfigError, Result};
pub use models::{
    AudioMode, Channel, ChannelBundle, InputType, JobKey, JobPurpose, OutputProfile,
    OutputTarget, RetentionPolicy, TimeShiftProfile, VideoMode, Weekdays, WeeklySchedule,
};
pub use recording::{PruneReport, RetentionEngine, SegmentFile, SegmentInventory};
pub use schedule::is_active;
pub use store::{
    ChannelRepository, SqliteChannelStore, SqliteChannelStoreBuilder, StaticChannelRepository,
    StoreError, StoreResult,
};
pub use supervisor::{
    JobExit, JobOutput, JobSnapshot, LaunchSpec, ManagedProcess, ProcessLauncher,
    ProcessSupervisor, ReconcileReport, RunningJob, SystemLauncher,
};
