//! Domain model - タスク・ワーカー・予約・リースのレコード
//!
//! ここにある型はストレージにもキューにも依存しない純粋なデータです。
//! 状態遷移のルールは `TaskRecord` と `TaskState` に閉じ込めています。

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod lock;
pub mod resource;
pub mod state;
pub mod task;
pub mod worker;

pub use envelope::{DispatchRequest, JobArgs, JobEnvelope, JobName, Message};
pub use errors::{JobError, TaskError};
pub use ids::{ReservationId, TaskId};
pub use lock::LockRecord;
pub use resource::{CreatedResource, Reservation, ResourceKey};
pub use state::TaskState;
pub use task::{TaskRecord, TaskView, Transition};
pub use worker::{Liveness, ProcessRole, WorkerMark, WorkerName, WorkerRecord};
