//! 业务状态根（Aggregate）抽象
//!
//! 事件缓冲以能力组合的方式提供：状态根持有一个 `EventRecorder` 字段，
//! 通过 `Aggregate` 暴露；`#[aggregate_root]` 宏负责注入字段并生成实现。
//!
//! 约束：`raise` 只能在业务方法完成校验并应用状态变更之后调用，
//! 事件是对已发生事实的陈述，绝不预先记录。
//!
use crate::domain_event::{DomainEvent, EventPayload, EventRecorder};
use crate::entity::Entity;
use crate::error::DomainResult;
use crate::persist::AggregateState;
use serde::{Serialize, de::DeserializeOwned};

/// 业务状态根接口
pub trait Aggregate: Entity + Serialize + DeserializeOwned + Send + Sync {
    const TYPE: &'static str;

    fn recorder(&self) -> &EventRecorder;

    fn recorder_mut(&mut self) -> &mut EventRecorder;

    /// 软删除标记
    fn is_deleted(&self) -> bool;

    fn set_deleted(&mut self, deleted: bool);

    /// 以当前状态根的身份记录一条事实
    fn raise<P>(&mut self, payload: &P) -> DomainResult<()>
    where
        P: EventPayload,
        Self: Sized,
    {
        let event = DomainEvent::from_payload(Self::TYPE, self.id().to_string(), payload)?;
        self.recorder_mut().record(event);
        Ok(())
    }
}

/// 对象安全的状态根视图，供工作单元持有异构的已变更状态根
pub trait AggregateRoot: Send + Sync {
    fn aggregate_type(&self) -> &str;

    fn aggregate_id(&self) -> String;

    fn to_state(&self) -> DomainResult<AggregateState>;

    fn pending_events(&self) -> &[DomainEvent];

    fn last_sequence(&self) -> u64;

    /// 提交成功后：清空缓冲并推进已提交序列号
    fn mark_committed(&mut self, last_sequence: u64);
}

impl<A> AggregateRoot for A
where
    A: Aggregate,
{
    fn aggregate_type(&self) -> &str {
        A::TYPE
    }

    fn aggregate_id(&self) -> String {
        self.id().to_string()
    }

    fn to_state(&self) -> DomainResult<AggregateState> {
        AggregateState::from_aggregate(self)
    }

    fn pending_events(&self) -> &[DomainEvent] {
        self.recorder().pending_events()
    }

    fn last_sequence(&self) -> u64 {
        self.recorder().last_sequence()
    }

    fn mark_committed(&mut self, last_sequence: u64) {
        let recorder = self.recorder_mut();
        recorder.clear_events();
        recorder.advance_to(last_sequence);
    }
}
