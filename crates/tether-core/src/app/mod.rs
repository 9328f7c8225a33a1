//! App - アプリケーション層
//!
//! ports を組み合わせてディスパッチャを実装します。
//!
//! # 主要コンポーネント
//! - **TaskManager**: タスクの状態遷移
//! - **WorkerRegistry**: heartbeat と生存判定
//! - **ReservationManager**: リソース予約（唯一の排他プリミティブ）
//! - **DispatchLoop**: 受付キュー → ワーカー専用キュー（リーダーのみ）
//! - **LeaderElection**: ロック行によるリース
//! - **HeartbeatReaper**: 消えたワーカーの回収
//! - **CancellationService**: キャンセル
//! - **WorkerProcess**: ワーカー側のジョブ実行
//! - **AppBuilder / Tasking**: ワイヤリング

pub mod builder;
pub mod cancel;
pub mod context;
pub mod dispatch;
pub mod handle;
pub mod leader;
pub mod reaper;
pub mod reservations;
pub mod status;
pub mod submit;
pub mod tasks;
pub mod worker_loop;
pub mod workers;

pub use self::builder::{AppBuilder, BuildError, Tasking};
pub use self::cancel::{CancelOutcome, CancellationService};
pub use self::context::JobContext;
pub use self::dispatch::DispatchLoop;
pub use self::handle::ProcessHandle;
pub use self::leader::{LeaderElection, LeaderStatus};
pub use self::reaper::{HeartbeatReaper, ReapReport};
pub use self::reservations::ReservationManager;
pub use self::status::{ClusterStatus, TaskCounts};
pub use self::submit::{SubmitOptions, Submission, Submitter, TaskHandle};
pub use self::tasks::TaskManager;
pub use self::worker_loop::WorkerProcess;
pub use self::workers::WorkerRegistry;
