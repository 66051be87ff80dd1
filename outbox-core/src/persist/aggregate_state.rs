use crate::{
    aggregate::Aggregate,
    error::{DomainError, DomainResult as Result},
};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 业务状态根的持久化形态：与 Outbox 记录写入同一事务。
///
/// 行不做物理删除，`is_deleted` 是显式谓词，由每条读取路径自行决定是否可见。
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct AggregateState {
    #[builder(into)]
    aggregate_type: String,
    #[builder(into)]
    aggregate_id: String,
    state: Value,
    #[builder(default)]
    is_deleted: bool,
    /// 读取时由存储层填充的已提交序列号
    #[builder(default)]
    last_sequence: u64,
}

impl AggregateState {
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn with_last_sequence(mut self, last_sequence: u64) -> Self {
        self.last_sequence = last_sequence;
        self
    }

    /// 将状态反序列化为聚合实例，并恢复其已提交序列号
    pub fn to_aggregate<A>(&self) -> Result<A>
    where
        A: Aggregate,
    {
        if A::TYPE != self.aggregate_type {
            return Err(DomainError::TypeMismatch {
                expected: A::TYPE.to_string(),
                found: self.aggregate_type.clone(),
            });
        }

        let mut aggregate: A = serde_json::from_value(self.state.clone())?;
        aggregate.set_deleted(self.is_deleted);
        aggregate.recorder_mut().advance_to(self.last_sequence);
        Ok(aggregate)
    }

    /// 从聚合实例创建持久化状态
    pub fn from_aggregate<A>(aggregate: &A) -> Result<Self>
    where
        A: Aggregate,
    {
        Ok(Self {
            aggregate_type: A::TYPE.to_string(),
            aggregate_id: aggregate.id().to_string(),
            state: serde_json::to_value(aggregate)?,
            is_deleted: aggregate.is_deleted(),
            last_sequence: aggregate.recorder().last_sequence(),
        })
    }
}
