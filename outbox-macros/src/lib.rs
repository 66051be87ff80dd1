use proc_macro::TokenStream;

mod aggregate_root;
mod domain_event;
mod entity_id;
mod utils;

/// 业务状态根宏
/// - 注入 `id`、软删除标记 `deleted` 与事件缓冲 `recorder`
/// - 生成 `::outbox_core::entity::Entity` 与 `::outbox_core::aggregate::Aggregate` 实现
/// - 参数：`#[aggregate_root(type = "order", id = OrderId)]`，`type` 默认为结构体名，`id` 默认 `String`
#[proc_macro_attribute]
pub fn aggregate_root(attr: TokenStream, item: TokenStream) -> TokenStream {
    aggregate_root::expand(attr, item)
}

/// 领域事件宏：为事件枚举生成 `EventPayload` 实现
#[proc_macro_attribute]
pub fn domain_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    domain_event::expand(attr, item)
}

/// 标识宏
/// 用于 `struct MessageId(Uuid);` 这类单字段包装类型，生成 `Display`、`FromStr` 与 `From` 转换
#[proc_macro_attribute]
pub fn entity_id(attr: TokenStream, item: TokenStream) -> TokenStream {
    entity_id::expand(attr, item)
}
