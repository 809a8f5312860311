//! Domain model: ids, task descriptors, inputs, versions and the records the
//! service keeps.

pub mod descriptor;
pub mod ids;
pub mod inputs;
pub mod payload;
pub mod records;
pub mod version;

pub use descriptor::{Parameter, Size, TaskDescriptor};
pub use ids::{ClientId, ExecutionId, Id, IdMarker, InstanceId, SessionId};
pub use inputs::TaskInputs;
pub use records::{
    ExecutionRecord, ExecutionStatus, ExecutionUpdate, InstanceRecord, InstanceRegistration,
    InstanceUpdate, LogLevel, LogRecord, OutcomeStatus, TaskOutcome, TaskRecord,
    TaskRegistration,
};
pub use version::{derive_version, resolve_version};
