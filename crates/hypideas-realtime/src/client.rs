use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use hypideas_types::events::RawChange;

use crate::ChangeFeed;
use crate::error::RealtimeError;
use crate::protocol::{self, ChangeFilter, Frame};
use crate::subscription::Subscription;

/// The service drops sockets that stay silent for longer than this.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

enum Command {
    Join {
        id: u64,
        topic: String,
        filters: Vec<ChangeFilter>,
        tx: mpsc::UnboundedSender<RawChange>,
    },
    Leave {
        id: u64,
    },
    AccessToken(String),
    Shutdown,
}

struct Route {
    topic: String,
    filters: Vec<ChangeFilter>,
    tx: mpsc::UnboundedSender<RawChange>,
}

/// Client for the realtime websocket. One background task owns the socket
/// and fans incoming row changes out to subscriptions.
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl RealtimeClient {
    pub async fn connect(url: &Url, access_token: Option<String>) -> Result<Self, RealtimeError> {
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!("Connected to realtime at {}", url.host_str().unwrap_or("?"));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(ws, rx, access_token));
        Ok(Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Use a refreshed access token for current and future channels.
    pub fn set_access_token(&self, token: String) -> Result<(), RealtimeError> {
        self.commands
            .send(Command::AccessToken(token))
            .map_err(|_| RealtimeError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl ChangeFeed for RealtimeClient {
    fn subscribe(&self, topic: &str, filters: Vec<ChangeFilter>) -> Result<Subscription, RealtimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Join {
                id,
                topic: topic.to_string(),
                filters,
                tx,
            })
            .map_err(|_| RealtimeError::Closed)?;

        let commands = self.commands.clone();
        Ok(Subscription::new(topic, rx, move || {
            let _ = commands.send(Command::Leave { id });
        }))
    }
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_connection(ws: Socket, mut commands: mpsc::UnboundedReceiver<Command>, mut token: Option<String>) {
    let (mut sink, mut stream) = ws.split();
    let mut routes: HashMap<u64, Route> = HashMap::new();
    let mut reference: u64 = 0;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        let outgoing: Vec<Frame> = tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Join { id, topic, filters, tx } => {
                        // One join per topic; a second subscriber rejoins with
                        // the combined filters.
                        let mut frames = Vec::new();
                        if routes.values().any(|r| r.topic == topic) {
                            reference += 1;
                            frames.push(protocol::leave_frame(&topic, reference));
                        }
                        routes.insert(id, Route { topic: topic.clone(), filters, tx });
                        reference += 1;
                        frames.push(protocol::join_frame(&topic, &topic_filters(&routes, &topic), token.as_deref(), reference));
                        debug!("Joining {}", topic);
                        frames
                    }
                    Command::Leave { id } => {
                        let Some(route) = routes.remove(&id) else { continue };
                        reference += 1;
                        let mut frames = vec![protocol::leave_frame(&route.topic, reference)];
                        let remaining = topic_filters(&routes, &route.topic);
                        if !remaining.is_empty() {
                            reference += 1;
                            frames.push(protocol::join_frame(&route.topic, &remaining, token.as_deref(), reference));
                        }
                        debug!("Leaving {}", route.topic);
                        frames
                    }
                    Command::AccessToken(new_token) => {
                        let mut topics: Vec<&str> = routes.values().map(|r| r.topic.as_str()).collect();
                        topics.sort_unstable();
                        topics.dedup();
                        let frames = topics
                            .into_iter()
                            .map(|t| {
                                reference += 1;
                                protocol::access_token_frame(t, &new_token, reference)
                            })
                            .collect();
                        token = Some(new_token);
                        frames
                    }
                    Command::Shutdown => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        route_frame(&text, &routes);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Realtime socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Realtime socket error: {}", e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                reference += 1;
                vec![protocol::heartbeat_frame(reference)]
            }
        };

        for frame in outgoing {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not encode {} frame: {}", frame.event, e);
                    continue;
                }
            };
            trace!("-> {} {}", frame.topic, frame.event);
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!("Realtime send failed: {}", e);
                return;
            }
        }
    }

    let _ = sink.close().await;
    // Dropping the routes ends every subscription's stream.
    info!("Realtime connection task finished ({} subscriptions)", routes.len());
}

fn topic_filters(routes: &HashMap<u64, Route>, topic: &str) -> Vec<ChangeFilter> {
    let mut filters: Vec<ChangeFilter> = Vec::new();
    for route in routes.values().filter(|r| r.topic == topic) {
        for f in &route.filters {
            if !filters.contains(f) {
                filters.push(f.clone());
            }
        }
    }
    filters
}

/// Deliver a frame's change to matching subscriptions. Routes are only
/// added and removed by join and leave commands, so a leave always finds
/// the topic it has to leave.
fn route_frame(text: &str, routes: &HashMap<u64, Route>) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring unreadable realtime frame: {}", e);
            return;
        }
    };
    if let Some(reason) = protocol::failure(&frame) {
        warn!("Realtime {} failed: {}", frame.topic, reason);
        return;
    }
    if frame.event == protocol::EVENT_CLOSE {
        debug!("Channel {} closed", frame.topic);
        return;
    }

    let change = match protocol::parse_change(&frame) {
        None => return,
        Some(Ok(change)) => change,
        Some(Err(e)) => {
            warn!("Ignoring malformed change on {}: {}", frame.topic, e);
            return;
        }
    };

    let topic = protocol::channel_name(&frame.topic);
    for route in routes.values() {
        if route.topic == topic && route.filters.iter().any(|f| f.matches(&change)) {
            // A closed receiver belongs to a dropped subscription whose
            // leave command is still queued.
            let _ = route.tx.send(change.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::WebSocketStream;

    type Server = WebSocketStream<TcpStream>;

    /// Accept one websocket client on a random local port.
    async fn serve() -> (Url, JoinHandle<Server>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        (url, server)
    }

    async fn connect(token: Option<&str>) -> (RealtimeClient, Server) {
        let (url, server) = serve().await;
        let client = RealtimeClient::connect(&url, token.map(String::from)).await.unwrap();
        (client, server.await.unwrap())
    }

    async fn next_frame(ws: &mut Server) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await
                .expect("no frame within 3s")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn push_change(ws: &mut Server, name: &str, data: Value) {
        let frame = Frame {
            topic: protocol::channel_topic(name),
            event: protocol::EVENT_POSTGRES_CHANGES.into(),
            payload: json!({ "ids": [1], "data": data }),
            reference: None,
        };
        let text = serde_json::to_string(&frame).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    fn filter_count(frame: &Frame) -> usize {
        frame.payload["config"]["postgres_changes"]
            .as_array()
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn messages_in(channel: &str) -> ChangeFilter {
        ChangeFilter::table("messages").column_eq("channel_id", channel)
    }

    #[tokio::test]
    async fn joins_routes_and_leaves_a_topic() {
        let (client, mut server) = connect(Some("tok")).await;

        let mut sub = client.subscribe("chat_x", vec![messages_in("c1")]).unwrap();
        let join = next_frame(&mut server).await;
        assert_eq!(join.topic, "realtime:chat_x");
        assert_eq!(join.event, protocol::EVENT_JOIN);
        assert_eq!(join.payload["access_token"], "tok");
        assert_eq!(join.payload["config"]["postgres_changes"][0]["filter"], "channel_id=eq.c1");

        push_change(
            &mut server,
            "chat_x",
            json!({ "table": "messages", "type": "INSERT", "record": { "id": "m2", "channel_id": "c2" }, "old_record": {} }),
        )
        .await;
        push_change(
            &mut server,
            "chat_x",
            json!({ "table": "messages", "type": "INSERT", "record": { "id": "m1", "channel_id": "c1" }, "old_record": {} }),
        )
        .await;
        let change = tokio::time::timeout(Duration::from_secs(3), sub.recv()).await.unwrap().unwrap();
        assert_eq!(change.record["id"], "m1");

        drop(sub);
        let leave = next_frame(&mut server).await;
        assert_eq!(leave.topic, "realtime:chat_x");
        assert_eq!(leave.event, protocol::EVENT_LEAVE);

        // Nothing else was sent for chat_x: the next frame is this join.
        let _other = client.subscribe("chat_y", vec![messages_in("c9")]).unwrap();
        let join = next_frame(&mut server).await;
        assert_eq!(join.topic, "realtime:chat_y");
        assert_eq!(join.event, protocol::EVENT_JOIN);
    }

    #[tokio::test]
    async fn shared_topic_rejoins_with_combined_filters() {
        let (client, mut server) = connect(None).await;

        let first = client.subscribe("chat_x", vec![messages_in("c1")]).unwrap();
        assert_eq!(filter_count(&next_frame(&mut server).await), 1);

        let second = client
            .subscribe("chat_x", vec![ChangeFilter::table("typing_indicators")])
            .unwrap();
        assert_eq!(next_frame(&mut server).await.event, protocol::EVENT_LEAVE);
        let rejoin = next_frame(&mut server).await;
        assert_eq!(rejoin.event, protocol::EVENT_JOIN);
        assert_eq!(filter_count(&rejoin), 2);

        drop(first);
        assert_eq!(next_frame(&mut server).await.event, protocol::EVENT_LEAVE);
        let rejoin = next_frame(&mut server).await;
        assert_eq!(rejoin.event, protocol::EVENT_JOIN);
        assert_eq!(rejoin.payload["config"]["postgres_changes"][0]["table"], "typing_indicators");

        drop(second);
        assert_eq!(next_frame(&mut server).await.event, protocol::EVENT_LEAVE);
    }

    #[tokio::test]
    async fn change_for_a_dropped_subscription_still_leaves() {
        let (client, mut server) = connect(None).await;
        let sub = client.subscribe("chat_x", vec![messages_in("c1")]).unwrap();
        next_frame(&mut server).await;

        push_change(
            &mut server,
            "chat_x",
            json!({ "table": "messages", "type": "INSERT", "record": { "id": "m1", "channel_id": "c1" }, "old_record": {} }),
        )
        .await;
        drop(sub);

        let leave = next_frame(&mut server).await;
        assert_eq!(leave.topic, "realtime:chat_x");
        assert_eq!(leave.event, protocol::EVENT_LEAVE);
    }

    #[tokio::test]
    async fn refreshed_token_reaches_joined_and_future_channels() {
        let (client, mut server) = connect(Some("old")).await;
        let _a = client.subscribe("chat_a", vec![messages_in("a")]).unwrap();
        let _b = client.subscribe("chat_b", vec![messages_in("b")]).unwrap();
        next_frame(&mut server).await;
        next_frame(&mut server).await;

        client.set_access_token("fresh".into()).unwrap();
        for topic in ["realtime:chat_a", "realtime:chat_b"] {
            let push = next_frame(&mut server).await;
            assert_eq!(push.topic, topic);
            assert_eq!(push.event, protocol::EVENT_ACCESS_TOKEN);
            assert_eq!(push.payload["access_token"], "fresh");
        }

        let _c = client.subscribe("chat_c", vec![messages_in("c")]).unwrap();
        let join = next_frame(&mut server).await;
        assert_eq!(join.topic, "realtime:chat_c");
        assert_eq!(join.payload["access_token"], "fresh");
    }

    #[tokio::test]
    async fn server_close_ends_subscriptions() {
        let (client, mut server) = connect(None).await;
        let mut sub = client.subscribe("chat_x", vec![messages_in("c1")]).unwrap();
        next_frame(&mut server).await;

        server.close(None).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(3), sub.recv()).await.unwrap();
        assert!(end.is_none());
    }
}
