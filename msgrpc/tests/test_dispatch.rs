#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use msgrpc::{
    BoxError, Client, DirectTransport, Dispatcher, ErrorKind, Next, Request, Router,
};
use serde_json::{Map, Value, json};

#[msgrpc::service]
trait Calculator {
    async fn add(&self, a: i64, b: i64) -> Result<i64, BoxError>;
    async fn scale(&self, value: f64, factor: Option<f64>) -> Result<f64, BoxError>;
    async fn div(&self, a: i64, b: i64) -> msgrpc::Result<i64>;
    async fn tag(&self, name: String, labels: Option<Vec<String>>) -> Result<String, String>;
}

struct CalculatorImpl;

impl Calculator for CalculatorImpl {
    async fn add(&self, a: i64, b: i64) -> Result<i64, BoxError> {
        Ok(a + b)
    }

    async fn scale(&self, value: f64, factor: Option<f64>) -> Result<f64, BoxError> {
        Ok(value * factor.unwrap_or(2.0))
    }

    async fn div(&self, a: i64, b: i64) -> msgrpc::Result<i64> {
        a.checked_div(b).ok_or_else(|| {
            msgrpc::Error::new(ErrorKind::InvalidArgument, "division by zero".into())
        })
    }

    async fn tag(&self, name: String, labels: Option<Vec<String>>) -> Result<String, String> {
        match labels {
            Some(labels) if labels.is_empty() => Err("empty labels".into()),
            Some(labels) => Ok(format!("{name}[{}]", labels.join(","))),
            None => Ok(name),
        }
    }
}

type Seen = Arc<Mutex<Vec<Value>>>;

fn setup() -> (CalculatorClient<DirectTransport>, Seen) {
    let _ = tracing_subscriber::fmt().try_init();

    let mut router = Router::default();
    Arc::new(CalculatorImpl).msgrpc_export(&mut router).unwrap();
    assert_eq!(router.len(), 4);

    let seen = Seen::default();
    let dispatcher = Dispatcher::new(router).with_hook({
        let seen = seen.clone();
        move |request: Request, next: Next| {
            seen.lock()
                .unwrap()
                .push(serde_json::to_value(&request).unwrap());
            next.run(request)
        }
    });
    let transport = DirectTransport::new(dispatcher).with_echo(true);
    (CalculatorClient::new(transport), seen)
}

#[tokio::test]
async fn test_add() {
    let (client, _) = setup();
    assert_eq!(client.add(1, 2).await.unwrap(), 3);
    assert_eq!(<CalculatorImpl as Calculator>::NAME, "Calculator");
}

#[tokio::test]
async fn test_stub_envelope_shape() {
    let (client, seen) = setup();
    assert_eq!(client.scale(1.5, None).await.unwrap(), 3.0);
    assert_eq!(client.scale(1.5, Some(4.0)).await.unwrap(), 6.0);
    assert_eq!(
        client.tag("x".into(), Some(vec!["a".into(), "b".into()])).await.unwrap(),
        "x[a,b]"
    );

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        [
            json!({".method": "scale", "value": 1.5}),
            json!({".method": "scale", "value": 1.5, "factor": 4.0}),
            json!({".method": "tag", "name": "x", "labels": ["a", "b"]}),
        ]
    );
}

#[tokio::test]
async fn test_dispatch_matches_direct_invocation() {
    let (client, _) = setup();
    let service = CalculatorImpl;
    for (a, b) in [(0, 0), (-7, 3), (i64::MAX, 0), (40, 2)] {
        assert_eq!(client.add(a, b).await.unwrap(), service.add(a, b).await.unwrap());
        assert_eq!(client.div(a, 3).await.unwrap(), service.div(a, 3).await.unwrap());
    }
    assert_eq!(
        client.tag("solo".into(), None).await.unwrap(),
        service.tag("solo".into(), None).await.unwrap()
    );
}

#[tokio::test]
async fn test_status_codes_map_to_errors() {
    let (client, _) = setup();

    // 500 with the remote trace
    let err = client.div(1, 0).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RemoteExecution);
    assert!(err.msg.contains("Exception in call of div"));
    assert!(err.msg.contains("division by zero"));
    assert!(err.traceback.as_deref().is_some_and(|t| !t.is_empty()));

    let err = client.tag("x".into(), Some(vec![])).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RemoteExecution);
    assert!(err.msg.contains("empty labels"));

    // 404
    let generic: &Client<DirectTransport> = client.client();
    let err = generic
        .call::<_, i64>("sub", &json!({"a": 1, "b": 2}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.msg, ".method sub not found");

    // 400
    let err = generic
        .invoke(Request::default().with("a", json!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Protocol);

    // a wrongly typed argument is a failure of the call, not of dispatch
    let err = generic
        .call::<_, i64>("add", &json!({"a": "one", "b": 2}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RemoteExecution);
    assert!(err.msg.contains("invalid argument `a`"));

    // undeclared parameters are ignored
    let sum: i64 = generic
        .call("add", &json!({"a": 1, "b": 2, "c": 3}))
        .await
        .unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_runtime_stub() {
    let mut router = Router::default();
    Arc::new(CalculatorImpl).msgrpc_export(&mut router).unwrap();
    let scale = router.get("scale").unwrap().procedure.clone();
    assert_eq!(scale.required, ["value"]);
    assert_eq!(scale.optional, ["factor"]);

    let client = Client::new(DirectTransport::new(Dispatcher::new(router)));
    let stub = client.stub(&scale);
    assert_eq!(stub.call(vec![json!(5.0)], Map::new()).await.unwrap(), json!(10.0));

    let mut optional = Map::new();
    optional.insert("factor".into(), json!(0.5));
    assert_eq!(stub.call(vec![json!(5.0)], optional).await.unwrap(), json!(2.5));

    let err = stub.call(vec![], Map::new()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}
