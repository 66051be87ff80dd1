//! 实体（Entity）基础抽象
//!
//! 为业务状态根提供统一的标识能力。
//!
use std::{fmt::Display, str::FromStr};

/// 具备唯一标识的实体抽象
pub trait Entity: Send + Sync {
    /// 实体标识类型，要求可解析、可显示与可克隆
    type Id: FromStr + Clone + Display + Send + Sync;

    /// 使用给定标识创建实体（其余字段取默认值）
    fn new(id: Self::Id) -> Self;

    /// 获取实体标识
    fn id(&self) -> &Self::Id;
}
