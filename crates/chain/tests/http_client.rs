use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use rpcflood_chain::{ChainClient, ChainError, HttpChainClient};
use serde_json::{json, Value};
use tokio::sync::oneshot;

#[derive(Clone)]
struct MockNodeState {
    fail_with_status: bool,
}

struct MockNode {
    address: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockNode {
    async fn start(fail_with_status: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock node listener");
        let addr = listener.local_addr().expect("listener addr lookup");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = Router::new()
            .route("/", post(handle_rpc))
            .with_state(MockNodeState { fail_with_status });

        tokio::spawn(async move {
            let server = axum::serve(listener, app);
            let graceful = server.with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = graceful.await;
        });

        Self {
            address: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn handle_rpc(
    State(state): State<MockNodeState>,
    Json(request): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if state.fail_with_status {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let id = request["id"].clone();
    let body = match request["method"].as_str() {
        Some("eth_getBlockByNumber") => {
            assert_eq!(request["params"], json!(["latest", true]));
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "number": "0x2a",
                    "hash": "0xb10c",
                    "transactions": [
                        { "hash": "0xt1", "from": "0xa1", "to": "0xc1" },
                        { "hash": "0xt2", "from": "0xa2", "to": null }
                    ]
                }
            })
        }
        Some("eth_getBlockReceipts") => {
            assert_eq!(request["params"], json!(["0x2a"]));
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": [
                    { "transactionHash": "0xt1", "contractAddress": null,
                      "logs": [{ "address": "0xc1", "topics": ["0xddf2"] }] },
                    { "transactionHash": "0xt2", "contractAddress": "0xc2", "logs": [] }
                ]
            })
        }
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "method not found" }
        }),
    };
    Ok(Json(body))
}

#[tokio::test]
async fn fetches_latest_block_and_receipts() {
    let node = MockNode::start(false).await;
    let client = HttpChainClient::new(&node.address).unwrap();

    let block = client.latest_block().await.unwrap();
    assert_eq!(block.number, 42);
    assert_eq!(block.hash, "0xb10c");
    assert_eq!(block.transactions.len(), 2);

    let receipts = client.block_receipts(&block).await.unwrap();
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].logs[0].topics, vec!["0xddf2".to_string()]);
    assert_eq!(receipts[1].contract_address.as_deref(), Some("0xc2"));
}

#[tokio::test]
async fn http_status_failures_are_reported() {
    let node = MockNode::start(true).await;
    let client = HttpChainClient::new(&node.address).unwrap();

    match client.latest_block().await {
        Err(ChainError::Status { status, .. }) => assert_eq!(status, 503),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_node_is_an_http_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpChainClient::new(format!("http://{addr}")).unwrap();
    assert!(matches!(
        client.latest_block().await,
        Err(ChainError::Http(_))
    ));
}
