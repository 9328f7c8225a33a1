//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。ディスパッチャが依存する
//! 外部コラボレータ（永続ストア・メッセージキュー）と、時刻・ID・後片付けを
//! trait として定義します。

pub mod clock;
pub mod id_generator;
pub mod janitor;
pub mod queue;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::janitor::{Janitor, JanitorError};
pub use self::queue::{Delivery, DeliveryTag, MessageQueue, QueueError};
pub use self::store::{Store, StoreError};
