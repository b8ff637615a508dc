use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const SUBSCRIPTION_ID: &str = "0x9cef478923ff08bf67fde6c64013158d";

#[derive(Default)]
struct NodeStats {
    connections: AtomicUsize,
    disconnections: AtomicUsize,
    subscriptions: AtomicUsize,
    unsubscriptions: AtomicUsize,
    pings: AtomicUsize,
}

/// Local WebSocket node serving `eth_subscribe("newHeads")` and the text heartbeat.
///
/// Answers `"ping"` with `"pong"` unless pongs are switched off. Heads are pushed to
/// every subscribed connection with [`MockWsNode::push_block`].
pub struct MockWsNode {
    url: Url,
    pong: Arc<AtomicBool>,
    reject_subscribe: Arc<AtomicBool>,
    stats: Arc<NodeStats>,
    heads: broadcast::Sender<u64>,
    server: JoinHandle<()>,
}

impl MockWsNode {
    /// Starts the node on a random local port.
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = Url::parse(&format!("ws://{addr}"))?;

        let pong = Arc::new(AtomicBool::new(true));
        let reject_subscribe = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(NodeStats::default());
        let (heads, _) = broadcast::channel(64);

        let server = tokio::spawn(accept_loop(
            listener,
            pong.clone(),
            reject_subscribe.clone(),
            stats.clone(),
            heads.clone(),
        ));
        log::info!("Mock websocket node listening on {url}");

        Ok(Self {
            url,
            pong,
            reject_subscribe,
            stats,
            heads,
            server,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Switches `"pong"` replies on or off.
    pub fn set_pong(&self, enabled: bool) {
        self.pong.store(enabled, Ordering::SeqCst);
    }

    /// Makes `eth_subscribe` answer with a JSON-RPC error instead of an id.
    pub fn set_reject_subscribe(&self, rejected: bool) {
        self.reject_subscribe.store(rejected, Ordering::SeqCst);
    }

    /// Sends a new head notification for block `number` to all subscribers.
    pub fn push_block(&self, number: u64) {
        if self.heads.send(number).is_err() {
            log::debug!("No subscriber for block {number}");
        }
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn disconnections(&self) -> usize {
        self.stats.disconnections.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.stats.subscriptions.load(Ordering::SeqCst)
    }

    pub fn unsubscriptions(&self) -> usize {
        self.stats.unsubscriptions.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.stats.pings.load(Ordering::SeqCst)
    }
}

impl Drop for MockWsNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pong: Arc<AtomicBool>,
    reject_subscribe: Arc<AtomicBool>,
    stats: Arc<NodeStats>,
    heads: broadcast::Sender<u64>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("Mock websocket node accepted {peer}");
                tokio::spawn(serve_connection(
                    stream,
                    pong.clone(),
                    reject_subscribe.clone(),
                    stats.clone(),
                    heads.subscribe(),
                ));
            }
            Err(e) => {
                log::warn!("Mock websocket node failed to accept: {e}");
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    pong: Arc<AtomicBool>,
    reject_subscribe: Arc<AtomicBool>,
    stats: Arc<NodeStats>,
    mut heads: broadcast::Receiver<u64>,
) {
    let mut socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("Mock websocket handshake failed: {e}");
            return;
        }
    };
    stats.connections.fetch_add(1, Ordering::SeqCst);
    let mut subscribed = false;

    loop {
        tokio::select! {
            message = socket.next() => {
                let reply = match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &pong, &reject_subscribe, &stats, &mut subscribed)
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => None,
                };
                if let Some(reply) = reply {
                    if socket.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
            head = heads.recv() => match head {
                Ok(number) if subscribed => {
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": "eth_subscription",
                        "params": {
                            "subscription": SUBSCRIPTION_ID,
                            "result": { "number": format!("0x{number:x}") },
                        },
                    });
                    if socket.send(Message::Text(notification.to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Mock websocket node skipped {skipped} heads");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    stats.disconnections.fetch_add(1, Ordering::SeqCst);
    log::debug!("Mock websocket connection closed");
}

fn handle_text(
    text: &str,
    pong: &AtomicBool,
    reject_subscribe: &AtomicBool,
    stats: &NodeStats,
    subscribed: &mut bool,
) -> Option<String> {
    if text == "ping" {
        stats.pings.fetch_add(1, Ordering::SeqCst);
        return pong.load(Ordering::SeqCst).then(|| "pong".to_string());
    }

    let request: Value = serde_json::from_str(text).ok()?;
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    match request.get("method").and_then(Value::as_str) {
        Some("eth_subscribe") if reject_subscribe.load(Ordering::SeqCst) => Some(
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32000, "message": "subscriptions are not available" },
            })
            .to_string(),
        ),
        Some("eth_subscribe") => {
            *subscribed = true;
            stats.subscriptions.fetch_add(1, Ordering::SeqCst);
            Some(json!({ "jsonrpc": "2.0", "id": id, "result": SUBSCRIPTION_ID }).to_string())
        }
        Some("eth_unsubscribe") => {
            *subscribed = false;
            stats.unsubscriptions.fetch_add(1, Ordering::SeqCst);
            Some(json!({ "jsonrpc": "2.0", "id": id, "result": true }).to_string())
        }
        _ => Some(
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" },
            })
            .to_string(),
        ),
    }
}
