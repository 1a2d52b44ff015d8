//! Message trait - 型付き payload と queue の対応付け

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::QueueName;

/// Message binds a payload type to the queue it travels on.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct AppRefresh {
///     app_id: u32,
/// }
///
/// impl Message for AppRefresh {
///     const QUEUE: QueueName = QueueName::APP_REFRESH;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に envelope へ載せるため
/// - `DeserializeOwned`: consumer が raw JSON から復元するため
/// - `Send + Sync + 'static`: handler と一緒に Arc に格納するため
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: QueueName;
}
