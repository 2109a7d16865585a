use clap::Parser;
use msgrpc::{Dispatcher, Router, SocketServer, WorkerPoolConfig};
use msgrpc_demo::{Calculator, CalculatorImpl};
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Procedures executing at the same time.
    #[arg(long, default_value_t = 50)]
    pub workers: usize,

    /// Requests allowed to wait for a worker before new ones get 503.
    #[arg(long, default_value_t = 1024)]
    pub backlog: usize,

    /// Log every request and response.
    #[arg(long, default_value_t = false)]
    pub echo: bool,
}

#[tokio::main]
async fn main() -> msgrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let mut router = Router::default();
    Arc::new(CalculatorImpl::default()).msgrpc_export(&mut router)?;
    let mut dispatcher = Dispatcher::new(router);
    if args.echo {
        dispatcher = dispatcher.with_hook(|request, next| async move {
            tracing::info!("IN: {request:?}");
            let response = next.run(request).await;
            tracing::info!("OUT: {response:?}");
            response
        });
    }

    let config = WorkerPoolConfig {
        workers: args.workers,
        backlog: args.backlog,
    };
    let server = SocketServer::new(dispatcher, &config)?;
    let addr = server.listen(args.addr).await?;
    tracing::info!(
        "Serving {:?} on {addr} with {config:?}...",
        <CalculatorImpl as Calculator>::NAME
    );

    tokio::select! {
        () = server.join() => {}
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::error!("wait for ctrl-c failed: {e}");
            }
            server.stop();
            server.join().await;
        }
    }
    Ok(())
}
