use clap::Parser;
use msgrpc::{
    Client, ClientConfig, Dispatcher, Request, Response, Router, StatusCode,
    bus::{BusClient, BusEndpoint, BusServer, LocalBus},
};
use msgrpc_demo::{Calculator, CalculatorClient, CalculatorImpl};
use serde_json::json;
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of calculator members on the bus.
    #[arg(long, default_value_t = 3)]
    pub members: usize,

    /// Members that refuse every call.
    #[arg(long, default_value_t = 1)]
    pub failing: usize,

    /// Scatter collection window.
    #[arg(long, default_value = "500ms", value_parser = humantime_serde::re::humantime::parse_duration)]
    pub window: Duration,
}

const GROUP: &str = "calculators";

#[tokio::main]
async fn main() -> msgrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let bus = LocalBus::new();

    let mut servers = vec![];
    for idx in 0..args.members {
        let (mailbox, events) = bus.connect(&format!("calc-{idx}"))?;
        let endpoint = BusEndpoint::start(mailbox, events);
        endpoint.join_group(GROUP)?;

        let mut router = Router::default();
        Arc::new(CalculatorImpl::default()).msgrpc_export(&mut router)?;
        let mut dispatcher = Dispatcher::new(router);
        if idx < args.failing {
            dispatcher = dispatcher.with_hook(|_: Request, _| async {
                Response::error(StatusCode::INTERNAL_ERROR, "member is draining")
            });
        }
        servers.push((BusServer::serve(&endpoint, dispatcher)?, endpoint));
    }

    let (mailbox, events) = bus.connect("client")?;
    let endpoint = BusEndpoint::start(mailbox, events);
    let config = ClientConfig {
        scatter_timeout: args.window,
        ..Default::default()
    };
    let transport = BusClient::new(&endpoint, config)?.transport(GROUP);

    // a point call takes the first answer, whichever member sends it
    let calculator = CalculatorClient::new(transport.clone());
    tracing::info!("add rsp: {:?}", calculator.add(1, 2).await);

    let client = Client::new(transport);
    let request = Request::new("add").with("a", json!(20)).with("b", json!(22));
    let gathered = client.scatter(request).await?;
    tracing::info!(
        "scatter to {GROUP} ({:?}) gathered:\n{}",
        bus.members(GROUP),
        serde_json::to_string_pretty(&gathered).unwrap_or_default()
    );

    for (server, endpoint) in &servers {
        server.stop();
        endpoint.stop();
    }
    Ok(())
}
