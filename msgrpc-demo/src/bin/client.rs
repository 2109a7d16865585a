use clap::Parser;
use msgrpc::{Client, ClientConfig, Procedure, SocketTransport};
use msgrpc_demo::CalculatorClient;
use serde_json::{Map, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: std::net::SocketAddr,

    /// First operand.
    #[arg(short, default_value_t = 1)]
    pub a: i64,

    /// Second operand.
    #[arg(short, default_value_t = 2)]
    pub b: i64,

    /// Use MessagePack
    #[arg(long, default_value_t = false)]
    pub use_msgpack: bool,

    /// Per-call timeout.
    #[arg(long, default_value = "5s", value_parser = humantime_serde::re::humantime::parse_duration)]
    pub timeout: Duration,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, client: Arc<CalculatorClient<SocketTransport>>) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let state = state.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < args.secs {
                for _ in 0..256 {
                    let result = client.add(args.a, args.b).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        () = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("stress task failed: {e}");
                }
            }
        } => {}
        () = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> msgrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        timeout: args.timeout,
        use_msgpack: args.use_msgpack,
        ..Default::default()
    };
    let transport = SocketTransport::connect(args.addr, config).await?;
    let client = Arc::new(CalculatorClient::new(transport));

    if args.stress {
        stress_test(args, client).await;
        return Ok(());
    }

    tracing::info!("add rsp: {:?}", client.add(args.a, args.b).await);
    tracing::info!("scale rsp: {:?}", client.scale(args.a as f64, None).await);
    tracing::info!("div rsp: {:?}", client.div(args.a, args.b).await);

    // the same procedure through a runtime descriptor
    let add = Procedure::new("add").required("a").required("b");
    let generic: &Client<SocketTransport> = client.client();
    let rsp = generic
        .stub(&add)
        .call(vec![json!(args.a), json!(args.b)], Map::new())
        .await;
    tracing::info!("stub add rsp: {rsp:?}");

    let rsp = generic.call::<_, i64>("sub", &json!({"a": args.a})).await;
    tracing::info!("unknown method rsp: {rsp:?}");
    tracing::info!("calls answered: {:?}", client.calls().await);
    Ok(())
}
