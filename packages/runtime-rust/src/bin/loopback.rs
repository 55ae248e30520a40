//! Loopback exerciser: a consumer and a provider wired over the in-memory
//! transport, running concurrent request and progress exchanges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use courier_core::{
    CourierError, InteractionListener, InteractionType, Message, MessageHeader, Operation,
    ServiceDescriptor, ServiceKey, StandardError,
};
use courier_runtime::{
    ConsumerConfig, CourierConfig, CourierContext, EndpointConfig, ExecutionConfig,
    MemoryTransport, ProviderConfig, ProviderHandler, ProviderInteraction,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KEY: ServiceKey = ServiceKey::new(1, 1, 1);
const ECHO: Operation = Operation::new(KEY, 1, "echo", InteractionType::Request);
const COUNT: Operation = Operation::new(KEY, 2, "count", InteractionType::Progress);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Sticky,
    Pool,
}

#[derive(Parser)]
#[command(name = "courier-loopback")]
#[command(about = "Run request and progress exchanges over the in-memory transport")]
#[command(version)]
struct Cli {
    /// Number of concurrent request exchanges
    #[arg(long, env = "COURIER_REQUESTS", default_value_t = 100)]
    requests: usize,

    /// Number of concurrent progress exchanges
    #[arg(long, env = "COURIER_PROGRESS", default_value_t = 10)]
    progress: usize,

    /// Updates sent per progress exchange
    #[arg(long, env = "COURIER_UPDATES", default_value_t = 5)]
    updates: u64,

    /// Execution model for inbound deliveries
    #[arg(long, env = "COURIER_EXECUTION", value_enum, default_value_t = Mode::Sticky)]
    execution: Mode,

    /// Executors (sticky) or workers (pool)
    #[arg(long, env = "COURIER_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Transaction timeout in seconds
    #[arg(long, env = "COURIER_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Emit JSON log lines
    #[arg(long, env = "COURIER_JSON_LOGS")]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courier_runtime=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Echoes requests; answers progress exchanges with `n` numbered updates.
struct LoopbackProvider;

#[async_trait]
impl ProviderHandler for LoopbackProvider {
    async fn handle(
        &self,
        message: Message,
        interaction: ProviderInteraction,
    ) -> Result<(), StandardError> {
        let io = |e: CourierError| e.to_standard();
        match message.header.operation {
            1 => interaction.send_response(message.body).await.map_err(io),
            2 => {
                let n = message
                    .body
                    .elements()
                    .first()
                    .and_then(rmpv::Value::as_u64)
                    .unwrap_or(0);
                interaction.send_ack(()).await.map_err(io)?;
                for i in 1..=n {
                    interaction
                        .send_update(vec![rmpv::Value::from(i)])
                        .await
                        .map_err(io)?;
                }
                interaction.send_response(()).await.map_err(io)
            }
            _ => Err(StandardError::internal("unknown operation")),
        }
    }
}

/// Counts updates and reports the end of every progress exchange.
struct ProgressCounter {
    done: mpsc::UnboundedSender<Result<u64, StandardError>>,
    updates: std::sync::atomic::AtomicU64,
}

impl ProgressCounter {
    fn finish(&self, result: Result<u64, StandardError>) {
        // The receiver outlives every exchange.
        let _ = self.done.send(result);
    }
}

impl InteractionListener for ProgressCounter {
    fn progress_update_received(&self, _message: &Message) {
        self.updates
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn progress_update_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.finish(Err(error.clone()));
    }
    fn progress_response_received(&self, _message: &Message) {
        self.finish(Ok(self.updates.load(std::sync::atomic::Ordering::Relaxed)));
    }
    fn progress_response_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.finish(Err(error.clone()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let execution = match cli.execution {
        Mode::Sticky => ExecutionConfig::sticky(cli.workers),
        Mode::Pool => ExecutionConfig::pool(cli.workers),
    };
    let config = CourierConfig {
        execution,
        transaction_timeout: Duration::from_secs(cli.timeout_secs),
        ..CourierConfig::default()
    };
    let ctx = CourierContext::new(config, Arc::new(MemoryTransport::new()));
    let service = ServiceDescriptor::new(KEY, vec![ECHO, COUNT]);

    let provider = ctx
        .provider_manager()?
        .create_provider(
            ProviderConfig::new(service.clone(), Arc::new(LoopbackProvider))
                .with_endpoint(EndpointConfig::Exclusive(Some("loopback-provider".into()))),
        )
        .await
        .context("creating provider")?;
    let consumer = ctx
        .consumer_manager()?
        .create_consumer(ConsumerConfig::new(service, provider.uri().clone()))
        .await
        .context("creating consumer")?;
    info!(provider = %provider.uri(), consumer = %consumer.uri(), "loopback wired");

    let started = Instant::now();
    let mut requests = JoinSet::new();
    for i in 0..cli.requests {
        let consumer = consumer.clone();
        requests.spawn(async move {
            let text = format!("ping-{i}");
            let response = consumer.request(&ECHO, vec![rmpv::Value::from(text.as_str())]).await?;
            Ok::<bool, CourierError>(response.body.leading_str() == Some(text.as_str()))
        });
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for _ in 0..cli.progress {
        let listener = Arc::new(ProgressCounter {
            done: done_tx.clone(),
            updates: std::sync::atomic::AtomicU64::new(0),
        });
        consumer
            .progress(&COUNT, Some(listener), vec![rmpv::Value::from(cli.updates)])
            .await
            .context("starting progress exchange")?;
    }
    drop(done_tx);

    let mut mismatched = 0usize;
    let mut failed = 0usize;
    while let Some(joined) = requests.join_next().await {
        match joined.context("request task panicked")? {
            Ok(true) => {}
            Ok(false) => mismatched += 1,
            Err(e) => {
                warn!(error = %e, "request failed");
                failed += 1;
            }
        }
    }

    let mut short = 0usize;
    for _ in 0..cli.progress {
        let Some(result) = done_rx.recv().await else {
            bail!("progress listeners dropped before finishing");
        };
        match result {
            Ok(n) if n == cli.updates => {}
            Ok(n) => {
                warn!(expected = cli.updates, received = n, "progress exchange lost updates");
                short += 1;
            }
            Err(e) => {
                warn!(error = %e, "progress exchange failed");
                failed += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    let sent = consumer.stats();
    let served = provider.stats();
    ctx.close().await;

    println!(
        "{} requests, {} progress exchanges in {:.1?}: consumer sent {} received {}, provider received {} sent {}",
        cli.requests, cli.progress, elapsed, sent.sent, sent.received, served.received, served.sent,
    );
    if failed > 0 || mismatched > 0 || short > 0 {
        bail!("{failed} failed, {mismatched} mismatched, {short} incomplete exchanges");
    }
    Ok(())
}
