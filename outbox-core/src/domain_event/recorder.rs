use super::DomainEvent;

/// 事件记录器：业务状态根在完成自身不变式校验并应用变更之后，把事实追加到这里。
///
/// 记录器只维护内存缓冲，不参与判断操作是否合法，也不触碰存储。
/// `last_sequence` 为该状态根最近一次已提交的序列号，由提交管道在成功后推进。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRecorder {
    events: Vec<DomainEvent>,
    last_sequence: u64,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按记录顺序追加事件
    pub fn record(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// 只读快照
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// 推进已提交序列号（只增不减）
    pub fn advance_to(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }
}
