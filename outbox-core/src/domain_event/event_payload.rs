use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// 领域事件载荷需要满足的通用能力边界
pub trait EventPayload:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync
{
    /// 事件类型（形如 `OrderEvent.Placed` 或自定义类型名）
    fn event_type(&self) -> &str;
}
