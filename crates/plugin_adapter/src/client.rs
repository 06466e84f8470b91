//! Control-channel client
//!
//! One [`AdapterClient`] owns one TCP connection to the adapter plugin of a
//! running game server. Requests are correlated to responses by the key
//! `action_invokerId`; at most one call per key may be in flight. A reader
//! task splits the inbound stream into frames, resolves pending calls and
//! forwards unsolicited events on a channel handed out by
//! [`AdapterClient::take_events`].

use crate::codec::{call_key, encode_request, Correlator, Frame, FrameDecoder, RequestArg};
use crate::error::{AdapterError, AdapterResult};
use crate::types::{actions, payload_text, AdapterEvent, PlayerEntry, ScenarioReport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default deadline of a control-channel call.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingCall {
    call_id: u64,
    responder: oneshot::Sender<Value>,
}

type PendingTable = Arc<DashMap<String, PendingCall>>;

pub struct AdapterClient {
    addr: SocketAddr,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    pending: PendingTable,
    events: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    next_call_id: AtomicU64,
}

impl std::fmt::Debug for AdapterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterClient")
            .field("addr", &self.addr)
            .field("pending_calls", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AdapterClient {
    /// Connects to an adapter plugin and starts the reader task.
    pub async fn connect(addr: SocketAddr) -> AdapterResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| AdapterError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingTable = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            addr,
            read_half,
            pending.clone(),
            event_tx,
            closed.clone(),
        ));

        info!("🔌 Connected to adapter plugin at {}", addr);

        Ok(Self {
            addr,
            writer: AsyncMutex::new(Some(write_half)),
            pending,
            events: Mutex::new(Some(event_rx)),
            reader: Mutex::new(Some(reader)),
            closed,
            next_call_id: AtomicU64::new(1),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Hands out the receiver of unsolicited events. Only the first caller
    /// gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Sends an action and waits for the matching response frame.
    ///
    /// # Arguments
    ///
    /// * `action` - Action name, e.g. `save`
    /// * `invoker_id` - Caller id echoed back as the response correlator
    /// * `arg` - Optional raw text or JSON argument
    /// * `timeout` - Deadline for the response
    ///
    /// # Returns
    ///
    /// The decoded response payload. A call that times out is removed from
    /// the pending table and a late response for it is discarded.
    pub async fn execute_action(
        &self,
        action: &str,
        invoker_id: u64,
        arg: Option<RequestArg>,
        timeout: Duration,
    ) -> AdapterResult<Value> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }

        let key = call_key(action, invoker_id);
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (responder, response) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(AdapterError::CallInFlight {
                    action: action.to_string(),
                    invoker_id,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall { call_id, responder });
            }
        }

        let mut line = encode_request(action, invoker_id, arg.as_ref());
        line.push('\n');
        if let Err(e) = self.write_line(&line).await {
            self.forget_call(&key, call_id);
            return Err(e);
        }
        debug!("📨 Sent '{}' to adapter {}", line.trim_end(), self.addr);

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AdapterError::Closed),
            Err(_) => {
                self.forget_call(&key, call_id);
                warn!(
                    "⏱️ Adapter action '{}' for invoker {} timed out after {:?}",
                    action, invoker_id, timeout
                );
                Err(AdapterError::Timeout {
                    action: action.to_string(),
                    invoker_id,
                    timeout,
                })
            }
        }
    }

    /// Like [`execute_action`](Self::execute_action), decoding the payload.
    pub async fn execute_typed<T>(
        &self,
        action: &str,
        invoker_id: u64,
        arg: Option<RequestArg>,
        timeout: Duration,
    ) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let value = self.execute_action(action, invoker_id, arg, timeout).await?;
        serde_json::from_value(value).map_err(|source| AdapterError::UnexpectedPayload {
            action: action.to_string(),
            source,
        })
    }

    pub async fn chat(&self, invoker_id: u64, message: &str, timeout: Duration) -> AdapterResult<()> {
        self.execute_action(actions::CHAT, invoker_id, Some(message.into()), timeout)
            .await
            .map(|_| ())
    }

    pub async fn player_list(&self, invoker_id: u64, timeout: Duration) -> AdapterResult<Vec<PlayerEntry>> {
        self.execute_typed(actions::PLAYER_LIST, invoker_id, None, timeout)
            .await
    }

    /// Writes a save and returns its base filename (no extension).
    pub async fn save(&self, invoker_id: u64, timeout: Duration) -> AdapterResult<String> {
        let value = self
            .execute_action(actions::SAVE, invoker_id, None, timeout)
            .await?;
        Ok(payload_text(&value))
    }

    /// Captures the live view and returns the image filename.
    pub async fn screenshot(&self, invoker_id: u64, timeout: Duration) -> AdapterResult<String> {
        let value = self
            .execute_action(actions::SCREENSHOT, invoker_id, None, timeout)
            .await?;
        Ok(payload_text(&value))
    }

    pub async fn scenario(&self, invoker_id: u64, timeout: Duration) -> AdapterResult<ScenarioReport> {
        self.execute_typed(actions::SCENARIO, invoker_id, None, timeout)
            .await
    }

    /// Closes the connection. Pending calls fail with [`AdapterError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_reader();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let dropped = self.pending.len();
        self.pending.clear();
        info!(
            "🔌 Closed adapter connection {} ({} pending calls dropped)",
            self.addr, dropped
        );
    }

    async fn write_line(&self, line: &str) -> AdapterResult<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(AdapterError::Closed)?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Removes a pending call only if it is still the one we registered.
    fn forget_call(&self, key: &str, call_id: u64) {
        self.pending.remove_if(key, |_, call| call.call_id == call_id);
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for AdapterClient {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

async fn read_loop(
    addr: SocketAddr,
    mut reader: OwnedReadHalf,
    pending: PendingTable,
    events: mpsc::UnboundedSender<AdapterEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("🔌 Adapter plugin at {} closed the connection", addr);
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(frame) => dispatch(frame, &pending, &events),
                        Err(e) => warn!("⚠️ Skipping malformed frame from {}: {}", addr, e),
                    }
                }
            }
            Err(e) => {
                warn!("❌ Read error on adapter connection {}: {}", addr, e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.clear();
}

fn dispatch(frame: Frame, pending: &DashMap<String, PendingCall>, events: &mpsc::UnboundedSender<AdapterEvent>) {
    match frame.correlator {
        Correlator::Event => {
            debug!("📥 Adapter event '{}'", frame.name);
            let _ = events.send(AdapterEvent {
                name: frame.name,
                payload: frame.payload,
            });
        }
        Correlator::Invoker(invoker_id) => {
            let key = call_key(&frame.name, invoker_id);
            match pending.remove(&key) {
                Some((_, call)) => {
                    if call.responder.send(frame.payload).is_err() {
                        debug!("Response for {} arrived after its caller gave up", key);
                    }
                }
                None => debug!("Ignoring response {} with no pending call", key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn mock_plugin() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_save_round_trip_and_event() {
        let (listener, addr) = mock_plugin().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let request = lines.next_line().await.unwrap().unwrap();
            assert_eq!(request, "save;42");
            write_half
                .write_all(b"chat_e_hello\nsave_42_\"scenario1\"\n")
                .await
                .unwrap();
            // Keep the socket open until the client is done.
            let _ = lines.next_line().await;
        });

        let client = AdapterClient::connect(addr).await.unwrap();
        let mut events = client.take_events().unwrap();
        assert!(client.take_events().is_none());

        let saved = client.save(42, Duration::from_secs(5)).await.unwrap();
        assert_eq!(saved, "scenario1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "chat");
        assert_eq!(event.payload, json!("hello"));
        assert_eq!(client.pending_calls(), 0);

        client.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_late_frame_is_ignored() {
        let (listener, addr) = mock_plugin().await;
        let (late_tx, late_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "scenario;9");
            late_rx.await.unwrap();
            write_half
                .write_all(b"scenario_9_{\"name\":\"late\"}\n")
                .await
                .unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "scenario;9");
            write_half
                .write_all(b"scenario_9_{\"name\":\"fresh\",\"status\":\"completed\"}\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let client = AdapterClient::connect(addr).await.unwrap();
        let err = client
            .execute_action("scenario", 9, None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
        assert_eq!(client.pending_calls(), 0);

        late_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_calls(), 0);

        let report = client.scenario(9, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.name, "fresh");

        client.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_call_on_same_key_is_rejected() {
        let (listener, addr) = mock_plugin().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "player.list;1");
            // Answer in two pieces to exercise partial reads.
            write_half.write_all(b"player.list_1_[{\"name\":\"ann\",").await.unwrap();
            write_half.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write_half.write_all(b"\"group\":\"admin\"}]\n").await.unwrap();
            let _ = lines.next_line().await;
        });

        let client = Arc::new(AdapterClient::connect(addr).await.unwrap());
        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.player_list(1, Duration::from_secs(5)).await })
        };

        // Wait until the first call is registered.
        while client.pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = client
            .execute_action("player.list", 1, None, Duration::from_secs(5))
            .await;
        assert!(matches!(second, Err(AdapterError::CallInFlight { .. })));

        let roster = first.await.unwrap().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "ann");
        assert_eq!(roster[0].group.as_deref(), Some("admin"));

        client.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (listener, addr) = mock_plugin().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let client = Arc::new(AdapterClient::connect(addr).await.unwrap());
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.save(3, Duration::from_secs(30)).await })
        };
        while client.pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AdapterError::Closed)));
        assert!(matches!(
            client.chat(3, "hi", Duration::from_secs(1)).await,
            Err(AdapterError::Closed)
        ));
        server.await.unwrap();
    }
}
