mod common;

use common::{fast_config, init_tracing};
use dashmap::DashMap;
use postbus::transport::InMemoryTransport;
use postbus::{BusEngine, HandlerContext, Services, message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const TOTAL: u32 = 100;

#[message]
struct Ack {
    seq: u32,
}

#[derive(Default)]
struct Seen {
    by_seq: DashMap<u32, usize>,
    done: Notify,
}

async fn on_ack(ack: Ack, ctx: HandlerContext) -> anyhow::Result<()> {
    let seen = ctx.service::<Seen>()?;
    *seen.by_seq.entry(ack.seq).or_default() += 1;
    if seen.by_seq.len() == TOTAL as usize {
        seen.done.notify_one();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_are_each_delivered_exactly_once_in_the_happy_path() {
    init_tracing();

    let seen = Arc::new(Seen::default());
    let mut config = fast_config("concurrency");
    config.worker_count = 4;

    let handle = BusEngine::builder()
        .config(config)
        .transport(Arc::new(InMemoryTransport::default()))
        .services(Services::new().with_shared(seen.clone()))
        .handlers(|r| {
            r.register_fn(on_ack);
        })
        .build()
        .start()
        .await
        .unwrap();

    let mut senders = Vec::new();
    for seq in 0..TOTAL {
        let bus = handle.bus().clone();
        senders.push(tokio::spawn(async move { bus.send_local(&Ack { seq }).await }));
    }

    let mut ids = std::collections::HashSet::new();
    for sender in senders {
        let id = sender.await.unwrap().unwrap();
        assert!(ids.insert(id), "message ids must be unique");
    }

    tokio::time::timeout(Duration::from_secs(10), seen.done.notified())
        .await
        .expect("all acks handled");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.by_seq.len(), TOTAL as usize);
    assert!(seen.by_seq.iter().all(|entry| *entry.value() == 1));

    handle.stop().await.unwrap();
}
