use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};
use tracing::info;

use spool_core::app::DialBackoff;
use spool_core::{
    AmqpConnector, BrokerBuilder, BrokerConfig, EnqueueOptions, Envelope, Handler, HandlerError,
    InMemoryBroker, Message, QueueName, RetryPolicy, logging,
};

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

impl Message for Hello {
    const QUEUE: QueueName = QueueName::from_static("hello");
}

/// 指定回数だけわざと失敗してから成功する handler
struct HelloHandler {
    remaining_failures: AtomicU32,
    done: Arc<Notify>,
}

impl HelloHandler {
    fn new(failures: u32, done: Arc<Notify>) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            done,
        }
    }
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, envelope: &Envelope<Hello>) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::retry(format!("intentional failure (left={left})")));
        }

        println!("Hello, {}! (attempt {})", envelope.message().name, envelope.attempt());
        self.done.notify_one();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init();

    // `--amqp` なら SPOOL_* の設定で RabbitMQ に接続、それ以外は in-memory
    let use_amqp = std::env::args().any(|arg| arg == "--amqp");

    // (A) 設定。デモなので retry を短くする
    let mut config = if use_amqp {
        BrokerConfig::from_env()?
    } else {
        BrokerConfig::default()
    };
    config.retry = RetryPolicy::new(1.3, Duration::from_millis(50), Duration::from_secs(10));
    config.dial_backoff = DialBackoff {
        initial_ms: 50,
        ..DialBackoff::default()
    };

    // (B) handler を登録して Broker を組み立てる
    let done = Arc::new(Notify::new());
    let memory = InMemoryBroker::new();
    let connector: Arc<dyn spool_core::ports::Connector> = if use_amqp {
        Arc::new(AmqpConnector::new(config.url.clone()))
    } else {
        Arc::new(memory.connector())
    };
    let mut broker = BrokerBuilder::new(config)
        .connector(connector)
        .register::<Hello, _>(HelloHandler::new(2, Arc::clone(&done)))?
        .expect_queues(&[Hello::QUEUE])
        .build()?;

    // (C) consumer と delay scheduler を起動して投入
    broker.open()?;
    info!(
        consumer_prefetch = broker.config().consumer_prefetch,
        delay_queue = broker.config().run_delay_queue,
        "demo broker ready"
    );
    broker
        .enqueue(
            Hello {
                name: "spool".to_string(),
            },
            EnqueueOptions::default().max_attempts(5),
        )
        .await?;
    info!(queue = %Hello::QUEUE, "enqueued");

    // (D) 成功を待つ（2 回失敗 → delay queue 経由で 3 回目に成功）
    let finished = timeout(Duration::from_secs(30), done.notified()).await.is_ok();
    if !finished {
        eprintln!("timed out waiting for the handler");
    }

    // (E) graceful shutdown
    broker.close().await;
    Ok(())
}
