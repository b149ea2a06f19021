use proc_macro::TokenStream;

mod message;
mod utils;

/// 消息宏
/// - 合并/追加派生：Debug, Clone, Serialize, Deserialize
/// - 自动实现 `::postbus::Message`，类型标签默认取类型名
/// - 参数：`#[message(name = "orders.OrderPlaced")]` 指定稳定的类型标签
#[proc_macro_attribute]
pub fn message(attr: TokenStream, item: TokenStream) -> TokenStream {
    message::expand(attr, item)
}
