//! Impls - 実装（開発用・テスト用）
//!
//! ports の in-memory 実装です。1 プロセス内で複数のディスパッチャと
//! ワーカーを動かし、ストアとキューを共有させることでクラスタを再現します。

pub mod inmem_queue;
pub mod inmem_store;
pub mod janitor;

pub use self::inmem_queue::InMemoryMessageQueue;
pub use self::inmem_store::InMemoryStore;
pub use self::janitor::NoopJanitor;
