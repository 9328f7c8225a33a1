//! Job trait - 型付きジョブの定義
//!
//! ジョブ名（文字列）と引数の型を対応付けます。ディスパッチャは名前しか
//! 見ませんが、登録側とサブミット側は同じ型を共有できます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Job は名前と引数型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SyncRepository {
///     repository: String,
/// }
///
/// impl Job for SyncRepository {
///     const NAME: &'static str = "content.repository.sync.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: キューに載せる `JobArgs` への変換
/// - `DeserializeOwned`: ワーカー側での復元
/// - `Send + Sync + 'static`: ハンドラと一緒に Arc に格納するため
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// ジョブ名
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    const NAME: &'static str;
}
