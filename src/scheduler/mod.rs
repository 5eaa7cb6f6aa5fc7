pub mod dedication;
pub mod drive;
pub mod matcher;
pub mod queue;
pub mod registry;

pub use dedication::DedicationRule;
pub use drive::{DriveRecord, DriveState};
pub use matcher::MatchedJob;
pub use queue::{AccessMode, VolumeQueue, VolumeRequest};
pub use registry::{DeleteOutcome, DriveUpdate, GroupState, Registry};
