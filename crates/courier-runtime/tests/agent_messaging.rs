//! End-to-end agent scenarios over the local and mesh transports.

use courier_runtime::pattern::callback;
use courier_runtime::{
    Agent, LocalTransport, Pattern, PatternLayer, RequestLayer, RequestOptions, RpcFunctions,
    RpcLayer, RpcOptions,
};
use courier_types::{CourierError, HostConfig, Transport, TransportConfig};
use courier_wire::{Host, MeshTransport};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn local_transport() -> Arc<dyn Transport> {
    Arc::new(LocalTransport::default())
}

fn inbox(agent: &Agent) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    agent.on_receive(move |from, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((from, message));
            Ok(Value::Null)
        }
    });
    rx
}

fn adder(agent: &Agent) {
    agent.on_receive(|_from, message| async move {
        if message["op"] != "add" {
            return Err(CourierError::InvalidMessage(format!("unknown op in {message}")));
        }
        let sum: i64 = message["args"]
            .as_array()
            .map(|args| args.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        Ok(json!(sum))
    });
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("inbox closed")
}

#[tokio::test]
async fn test_send_delivers_sender_and_message() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    let mut a2_inbox = inbox(&a2);
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();
    a1.ready().await.unwrap();

    a1.send("a2", json!("hi")).await.unwrap();
    assert_eq!(recv(&mut a2_inbox).await, ("a1".to_string(), json!("hi")));
}

#[tokio::test]
async fn test_request_resolves_with_handler_result() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::default())).unwrap();
    a2.extend(Arc::new(RequestLayer::default())).unwrap();
    adder(&a2);
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    let result = a1
        .request("a2", json!({"op": "add", "args": [2, 3]}))
        .await
        .unwrap();
    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn test_request_handler_error_becomes_error_reply() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::default())).unwrap();
    a2.extend(Arc::new(RequestLayer::default())).unwrap();
    adder(&a2);
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    match a1.request("a2", json!({"op": "divide"})).await {
        Err(CourierError::Remote(msg)) => assert!(msg.contains("unknown op")),
        other => panic!("Expected remote error, got {other:?}"),
    }
    // The failing handler did not break a2's chain.
    let ok = a1
        .request("a2", json!({"op": "add", "args": [1, 1]}))
        .await
        .unwrap();
    assert_eq!(ok, json!(2));
}

#[tokio::test]
async fn test_request_timeout_and_late_reply_is_ignored() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::new(RequestOptions {
        timeout: Duration::from_millis(50),
    })))
    .unwrap();
    a2.extend(Arc::new(RequestLayer::default())).unwrap();

    let a1_plain = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&a1_plain);
    a1.on_receive(move |_from, _message| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(Value::Null) }
    });
    let a2_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&a2_calls);
    a2.on_receive(move |_from, _message| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("too late"))
        }
    });
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    let err = a1.request("a2", json!("slow")).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Timeout after 50ms");

    // Give the late reply time to arrive; it must not reach a1's handler
    // nor bounce back to a2 as a new request.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(a1_plain.load(Ordering::SeqCst), 0);
    assert_eq!(a2_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_late_replies_never_bounce_after_many_timeouts() {
    const REQUESTS: usize = 1100;
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::new(RequestOptions {
        timeout: Duration::from_millis(20),
    })))
    .unwrap();
    a2.extend(Arc::new(RequestLayer::default())).unwrap();

    let a1_plain = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&a1_plain);
    a1.on_receive(move |_from, _message| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(Value::Null) }
    });
    let a2_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&a2_calls);
    a2.on_receive(move |_from, message| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(message)
        }
    });
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    let outcomes = futures::future::join_all(
        (0..REQUESTS).map(|i| a1.request("a2", json!(i))),
    )
    .await;
    assert!(outcomes.iter().all(|r| matches!(r, Err(e) if e.is_timeout())));

    // Every reply now arrives after its request expired.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(a1_plain.load(Ordering::SeqCst), 0);
    assert_eq!(a2_calls.load(Ordering::SeqCst), REQUESTS);
}

#[tokio::test]
async fn test_rpc_calls_exposed_functions() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a2.define_method("add", |params, _from| async move {
        Ok(json!(params["a"].as_i64().unwrap_or(0) + params["b"].as_i64().unwrap_or(0)))
    })
    .unwrap();
    a2.define_method("fail", |_params, from| async move {
        Err(CourierError::InvalidMessage(format!("refusing {from}")))
    })
    .unwrap();
    let functions = RpcFunctions::from_agent(&a2, &["add", "fail"]);
    a2.extend(Arc::new(RpcLayer::new(functions, RpcOptions::default())))
        .unwrap();
    a1.extend(Arc::new(RpcLayer::default())).unwrap();
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    let sum = a1
        .rpc_call("a2", json!({"method": "add", "params": {"a": 2, "b": 3}}))
        .await
        .unwrap();
    assert_eq!(sum, json!(5));

    match a1.rpc_call("a2", json!({"method": "ping"})).await {
        Err(CourierError::Remote(msg)) => assert_eq!(msg, "Cannot find function: ping"),
        other => panic!("Expected remote error, got {other:?}"),
    }
    match a1.rpc_call("a2", json!({"method": "fail"})).await {
        Err(CourierError::Remote(msg)) => assert_eq!(msg, "Invalid message: refusing a1"),
        other => panic!("Expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rpc_malformed_envelope_gets_error_reply() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a2.extend(Arc::new(RpcLayer::default())).unwrap();
    let mut a1_inbox = inbox(&a1);
    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();

    a1.send("a2", json!({"jsonrpc": "2.0", "id": "m1"}))
        .await
        .unwrap();
    let (from, reply) = recv(&mut a1_inbox).await;
    assert_eq!(from, "a2");
    assert_eq!(reply["id"], "m1");
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .starts_with("No method or result defined. Message:"));
}

#[tokio::test]
async fn test_requests_are_unwrapped_before_patterns() {
    let transport = local_transport();
    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::default())).unwrap();

    // Loaded in the "wrong" order; the layers still sort themselves.
    a2.extend(Arc::new(RequestLayer::default())).unwrap();
    a2.extend(Arc::new(PatternLayer::default())).unwrap();
    assert_eq!(a2.chain(), vec!["request", "pattern"]);
    a2.listen(
        Pattern::Value(json!("ping")),
        callback(|_from, _message| async { Ok(json!("pong")) }),
    )
    .unwrap();

    a1.connect(&transport).await.unwrap();
    a2.connect(&transport).await.unwrap();
    assert_eq!(a1.request("a2", json!("ping")).await.unwrap(), json!("pong"));
    assert!(matches!(
        a1.request("a2", json!("other")).await,
        Err(CourierError::Remote(_))
    ));
}

#[tokio::test]
async fn test_request_across_hosts_over_mesh() {
    let config = HostConfig {
        request_timeout: Duration::from_secs(2),
        ..HostConfig::default()
    };
    let host_a = Host::new(config.clone());
    let host_b = Host::new(config);
    host_a.listen("127.0.0.1:0").await.unwrap();
    let b_url = host_b.listen("127.0.0.1:0").await.unwrap();
    host_a.join(&b_url).await.unwrap();

    let mesh_a: Arc<dyn Transport> = Arc::new(MeshTransport::new(
        host_a.clone(),
        &TransportConfig::new("mesh"),
    ));
    let mesh_b: Arc<dyn Transport> = Arc::new(MeshTransport::new(
        host_b.clone(),
        &TransportConfig::new("mesh"),
    ));

    let a1 = Agent::new("a1");
    let a2 = Agent::new("a2");
    a1.extend(Arc::new(RequestLayer::default())).unwrap();
    a2.extend(Arc::new(RequestLayer::default())).unwrap();
    adder(&a2);
    a1.connect(&mesh_a).await.unwrap();
    a2.connect(&mesh_b).await.unwrap();

    let result = a1
        .request("a2", json!({"op": "add", "args": [20, 22]}))
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    // The network id both hosts agreed on routes `scheme://network/id`.
    let network = host_a.network_id().unwrap();
    let result = a1
        .request(&format!("mesh://{network}/a2"), json!({"op": "add", "args": [1, 2]}))
        .await
        .unwrap();
    assert_eq!(result, json!(3));

    a1.disconnect_all().await.unwrap();
    a2.disconnect_all().await.unwrap();
    host_a.close().await.unwrap();
    host_b.close().await.unwrap();
}
