use alloy::primitives::U64;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::HeartbeatConfig;

/// Text frame sent to keep the connection alive.
pub const PING: &str = "ping";
/// Text frame the node answers a [`PING`] with.
pub const PONG: &str = "pong";

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const UNSUBSCRIBE_REQUEST_ID: u64 = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC message received on the subscription socket.
#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: String,
    result: NewHead,
}

#[derive(Debug, Deserialize)]
struct NewHead {
    number: U64,
}

/// What a text frame turned out to be.
#[derive(Debug, PartialEq)]
enum Frame {
    Pong,
    NewHead(u64),
    Subscribed(String),
    Failed(String),
    Other,
}

fn parse_frame(text: &str) -> Frame {
    if text == PONG {
        return Frame::Pong;
    }
    let message: RpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("Ignoring unparseable frame ({e}): {text}");
            return Frame::Other;
        }
    };

    if let Some(error) = message.error {
        return Frame::Failed(error.to_string());
    }
    if message.method.as_deref() == Some("eth_subscription") {
        if let Some(params) = message.params {
            log::trace!("Head {} on subscription {}", params.result.number, params.subscription);
            return Frame::NewHead(params.result.number.to::<u64>());
        }
    }
    if message.id == Some(SUBSCRIBE_REQUEST_ID) {
        if let Some(serde_json::Value::String(id)) = message.result {
            return Frame::Subscribed(id);
        }
    }
    Frame::Other
}

/// A live `newHeads` subscription over a WebSocket.
///
/// The socket is kept alive with a text `"ping"` every [`HeartbeatConfig::interval`];
/// when no `"pong"` comes back within [`HeartbeatConfig::pong_timeout`] the socket is
/// closed and the subscription ends. It is not re-established automatically.
pub struct BlockSubscription {
    shutdown: CancellationToken,
    closed: CancellationToken,
    socket_task: Option<JoinHandle<()>>,
}

impl BlockSubscription {
    /// Connects to `ws_url`, subscribes to new heads and calls `on_block` for every block.
    ///
    /// Returns once the node has confirmed the subscription; a rejected or unanswered
    /// `eth_subscribe` is an error. Callbacks run one at a time in the order blocks arrive.
    pub async fn connect<F, Fut>(
        ws_url: &Url,
        heartbeat: HeartbeatConfig,
        on_block: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        log::debug!("Connecting to websocket provider: {ws_url}");

        let (mut socket, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {ws_url}: {e}"))?;

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": SUBSCRIBE_REQUEST_ID,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        });
        socket
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to new heads: {e}"))?;

        let subscription_id =
            match tokio::time::timeout(SUBSCRIBE_TIMEOUT, await_subscribed(&mut socket)).await {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    release_socket(&mut socket).await;
                    return Err(e);
                }
                Err(_) => {
                    release_socket(&mut socket).await;
                    anyhow::bail!("No subscription confirmation within {SUBSCRIBE_TIMEOUT:?}");
                }
            };

        log::info!("Connected to websocket provider: {ws_url}, subscription {subscription_id}");

        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let (blocks_tx, blocks_rx) = mpsc::unbounded_channel();

        let socket_task = tokio::spawn(run_socket(
            socket,
            subscription_id,
            heartbeat,
            blocks_tx,
            shutdown.clone(),
            closed.clone(),
        ));
        // Detached: it ends with the channel or on shutdown.
        tokio::spawn(dispatch_blocks(blocks_rx, on_block, shutdown.clone()));

        Ok(Self {
            shutdown,
            closed,
            socket_task: Some(socket_task),
        })
    }

    /// Returns true once the socket loop has ended, for whatever reason.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the socket loop has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stops the subscription and releases the socket.
    ///
    /// Best-effort: unsubscribing and closing failures are logged, never returned.
    /// A block callback already running is not waited for, so a callback may close
    /// its own subscription. No further callback starts once this returns.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.socket_task.take() {
            if let Err(e) = task.await {
                log::debug!("Block subscription socket task ended abnormally: {e}");
            }
        }
    }
}

// Dropping without `close` still stops both tasks.
impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reads frames until the node answers the `eth_subscribe` request.
async fn await_subscribed<S>(socket: &mut S) -> anyhow::Result<String>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => match parse_frame(&text) {
                Frame::Subscribed(id) => return Ok(id),
                Frame::Failed(error) => {
                    anyhow::bail!("Node rejected subscription request: {error}")
                }
                _ => {}
            },
            Message::Close(frame) => {
                anyhow::bail!("Socket closed before subscription was confirmed: {frame:?}")
            }
            _ => {}
        }
    }
    anyhow::bail!("Socket ended before subscription was confirmed")
}

/// Reads the socket, answers the heartbeat and forwards block numbers until shutdown,
/// close, error, a rejected request or a missed pong.
async fn run_socket<S>(
    mut socket: S,
    subscription_id: String,
    heartbeat: HeartbeatConfig,
    blocks: mpsc::UnboundedSender<u64>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    let mut pong_deadline: Option<Instant> = None;
    let mut subscription_id = Some(subscription_id);

    loop {
        let deadline = pong_deadline;
        let watchdog = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(id) = subscription_id.take() {
                    let unsubscribe = json!({
                        "jsonrpc": "2.0",
                        "id": UNSUBSCRIBE_REQUEST_ID,
                        "method": "eth_unsubscribe",
                        "params": [id],
                    });
                    if let Err(e) = socket.send(Message::Text(unsubscribe.to_string())).await {
                        log::debug!("Ignoring unsubscribe failure: {e}");
                    }
                }
                release_socket(&mut socket).await;
                break;
            }
            _ = keep_alive.tick() => {
                if let Err(e) = socket.send(Message::Text(PING.to_string())).await {
                    log::warn!("Failed to send heartbeat ping: {e}");
                    break;
                }
                // Counted from the oldest unanswered ping.
                pong_deadline.get_or_insert_with(|| Instant::now() + heartbeat.pong_timeout);
            }
            _ = watchdog => {
                log::warn!(
                    "No pong within {:?}, closing block subscription socket",
                    heartbeat.pong_timeout
                );
                release_socket(&mut socket).await;
                break;
            }
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Frame::Pong => pong_deadline = None,
                    Frame::NewHead(number) => {
                        if blocks.send(number).is_err() {
                            log::debug!("Block dispatcher gone, dropping block {number}");
                        }
                    }
                    Frame::Failed(error) => {
                        log::warn!("Node rejected request, closing block subscription: {error}");
                        release_socket(&mut socket).await;
                        break;
                    }
                    Frame::Subscribed(_) | Frame::Other => {}
                },
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Block subscription socket closed by node: {frame:?}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Block subscription socket failed: {e}");
                    break;
                }
                None => {
                    log::info!("Block subscription socket ended");
                    break;
                }
            },
        }
    }

    closed.cancel();
}

/// Closes the socket, ignoring failures of an already broken connection.
async fn release_socket<S>(socket: &mut S)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, socket.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Ignoring socket close failure: {e}"),
        Err(_) => log::debug!("Socket close timed out, dropping connection"),
    }
}

async fn dispatch_blocks<F, Fut>(
    mut blocks: mpsc::UnboundedReceiver<u64>,
    on_block: F,
    shutdown: CancellationToken,
) where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let number = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            number = blocks.recv() => match number {
                Some(number) => number,
                None => break,
            },
        };
        on_block(number).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pong() {
        assert_eq!(parse_frame("pong"), Frame::Pong);
    }

    #[test]
    fn test_parse_new_head() {
        let text = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xcd0c3e8af590364c09d0fa6a1210faf5","result":{"number":"0x1b4","hash":"0x00"}}}"#;
        assert_eq!(parse_frame(text), Frame::NewHead(436));
    }

    #[test]
    fn test_parse_subscribe_response() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":"0xcd0c3e8af590364c09d0fa6a1210faf5"}"#;
        assert_eq!(
            parse_frame(text),
            Frame::Subscribed("0xcd0c3e8af590364c09d0fa6a1210faf5".to_string())
        );
    }

    #[test]
    fn test_parse_error_and_garbage() {
        let text = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"not supported"}}"#;
        assert!(matches!(parse_frame(text), Frame::Failed(_)));
        assert_eq!(parse_frame("hello"), Frame::Other);
    }
}
