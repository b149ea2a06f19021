use crate::handler::{Handle, HandlerContext};
use crate::message::{Failed, Message};
use crate::retry::FailureRecord;
use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

pub(crate) type InvokeFn =
    Arc<dyn for<'a> Fn(&'a HandlerContext) -> HandlerFuture<'a> + Send + Sync>;

pub(crate) type FailedInvokeFn = Arc<
    dyn for<'a> Fn(&'a HandlerContext, Vec<FailureRecord>, u32) -> HandlerFuture<'a>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct Registration<F> {
    pub(crate) name: String,
    pub(crate) invoke: F,
}

/// 消息类型标签 → 有序处理器构造器列表
///
/// - 启动时注册，随后冻结在 `Arc` 中只读使用，运行期无需加锁；
/// - 同一类型可注册多个处理器，按注册顺序依次执行；
/// - `register_failed*` 注册二级重试时接收 `Failed<M>` 的处理器。
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    direct: HashMap<&'static str, Vec<Registration<InvokeFn>>>,
    failed: HashMap<&'static str, Vec<Registration<FailedInvokeFn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器工厂：每条消息调用一次工厂构造新的处理器实例
    pub fn register<M, H, F>(&mut self, factory: F) -> &mut Self
    where
        M: Message,
        H: Handle<M> + 'static,
        F: Fn(&HandlerContext) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);

        let invoke = invoker(move |ctx| {
            let factory = factory.clone();

            Box::pin(async move {
                let message = ctx.envelope().decode::<M>()?;
                let handler = (factory)(ctx)?;
                handler.handle(message).await
            })
        });

        self.push_direct::<M>(type_name::<H>().to_string(), invoke)
    }

    /// 注册闭包处理器，闭包获得消息与拥有所有权的上下文
    pub fn register_fn<M, F, Fut>(&mut self, f: F) -> &mut Self
    where
        M: Message,
        F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);

        let invoke = invoker(move |ctx| {
            let f = f.clone();

            Box::pin(async move {
                let message = ctx.envelope().decode::<M>()?;
                (f)(message, ctx.clone()).await
            })
        });

        self.push_direct::<M>(format!("fn<{}>", M::TYPE), invoke)
    }

    /// 注册 `Failed<M>` 处理器工厂
    pub fn register_failed<M, H, F>(&mut self, factory: F) -> &mut Self
    where
        M: Message,
        H: Handle<Failed<M>> + 'static,
        F: Fn(&HandlerContext) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);

        let invoke = failed_invoker(move |ctx, failures, attempt| {
            let factory = factory.clone();

            Box::pin(async move {
                let failed = failed_carrier::<M>(ctx, failures, attempt)?;
                let handler = (factory)(ctx)?;
                handler.handle(failed).await
            })
        });

        self.push_failed::<M>(type_name::<H>().to_string(), invoke)
    }

    /// 注册 `Failed<M>` 闭包处理器
    pub fn register_failed_fn<M, F, Fut>(&mut self, f: F) -> &mut Self
    where
        M: Message,
        F: Fn(Failed<M>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);

        let invoke = failed_invoker(move |ctx, failures, attempt| {
            let f = f.clone();

            Box::pin(async move {
                let failed = failed_carrier::<M>(ctx, failures, attempt)?;
                (f)(failed, ctx.clone()).await
            })
        });

        self.push_failed::<M>(format!("fn<Failed<{}>>", M::TYPE), invoke)
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.direct.contains_key(message_type)
    }

    pub fn handler_count(&self, message_type: &str) -> usize {
        self.direct.get(message_type).map(Vec::len).unwrap_or(0)
    }

    pub fn failed_handler_count(&self, message_type: &str) -> usize {
        self.failed.get(message_type).map(Vec::len).unwrap_or(0)
    }

    /// 已注册处理器的消息类型（排序后的只读视图）
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.direct.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub(crate) fn handlers_for(&self, message_type: &str) -> &[Registration<InvokeFn>] {
        self.direct
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn failed_handlers_for(
        &self,
        message_type: &str,
    ) -> &[Registration<FailedInvokeFn>] {
        self.failed
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn push_direct<M: Message>(&mut self, name: String, invoke: InvokeFn) -> &mut Self {
        self.direct
            .entry(M::TYPE)
            .or_default()
            .push(Registration { name, invoke });
        self
    }

    fn push_failed<M: Message>(&mut self, name: String, invoke: FailedInvokeFn) -> &mut Self {
        self.failed
            .entry(M::TYPE)
            .or_default()
            .push(Registration { name, invoke });
        self
    }
}

// 通过显式的高阶生命周期约束固定闭包签名
fn invoker<F>(f: F) -> InvokeFn
where
    F: for<'a> Fn(&'a HandlerContext) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn failed_invoker<F>(f: F) -> FailedInvokeFn
where
    F: for<'a> Fn(&'a HandlerContext, Vec<FailureRecord>, u32) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn failed_carrier<M: Message>(
    ctx: &HandlerContext,
    failures: Vec<FailureRecord>,
    attempt: u32,
) -> anyhow::Result<Failed<M>> {
    let message = ctx.envelope().decode::<M>()?;
    Ok(Failed::new(
        message,
        ctx.message_id().to_string(),
        ctx.headers().clone(),
        failures,
        attempt,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
    }

    impl Message for OrderPlaced {
        const TYPE: &'static str = "sales.OrderPlaced";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct InvoiceIssued;

    impl Message for InvoiceIssued {
        const TYPE: &'static str = "billing.InvoiceIssued";
    }

    struct Audit;

    #[async_trait]
    impl Handle<OrderPlaced> for Audit {
        async fn handle(&self, _message: OrderPlaced) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn notify(_message: OrderPlaced, _ctx: HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_invoice(_message: InvoiceIssued, _ctx: HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn compensate(
        _failed: Failed<OrderPlaced>,
        _ctx: HandlerContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn registrations_keep_order_per_message_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderPlaced, _, _>(|_ctx: &HandlerContext| Ok(Audit))
            .register_fn(notify)
            .register_fn(on_invoice)
            .register_failed_fn(compensate);

        assert!(registry.handles(OrderPlaced::TYPE));
        assert_eq!(registry.handler_count(OrderPlaced::TYPE), 2);
        assert_eq!(registry.failed_handler_count(OrderPlaced::TYPE), 1);
        assert_eq!(registry.failed_handler_count(InvoiceIssued::TYPE), 0);
        assert_eq!(
            registry.registered_types(),
            vec![InvoiceIssued::TYPE, OrderPlaced::TYPE]
        );

        let names: Vec<&str> = registry
            .handlers_for(OrderPlaced::TYPE)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert!(names[0].ends_with("Audit"));
        assert_eq!(names[1], "fn<sales.OrderPlaced>");
        assert_eq!(
            registry.failed_handlers_for(OrderPlaced::TYPE)[0].name,
            "fn<Failed<sales.OrderPlaced>>"
        );
    }

    #[test]
    fn unknown_type_has_no_handlers() {
        let registry = HandlerRegistry::new();
        assert!(!registry.handles("nothing.Here"));
        assert!(registry.handlers_for("nothing.Here").is_empty());
        assert!(registry.failed_handlers_for("nothing.Here").is_empty());
    }
}
