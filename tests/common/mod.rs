#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures_util::{SinkExt, StreamExt};
use sealr::{Event, Filter};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

/// Minimal in-memory relay: stores published events, answers `REQ` with
/// stored matches followed by `EOSE`, and forwards new events to live
/// subscriptions.
pub struct MockRelay {
    pub addr: SocketAddr,
    events: Arc<Mutex<Vec<Event>>>,
    received: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    pub fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (feed, _) = broadcast::channel::<Event>(256);
        let received = Arc::new(AtomicUsize::new(0));
        let store = events.clone();
        let counter = received.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = store.clone();
                let feed = feed.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        handle(ws, store, counter, feed).await;
                    }
                });
            }
        });
        Self {
            addr,
            events,
            received,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn insert(&self, ev: Event) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn stored(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of `EVENT` frames received, duplicates included.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections.
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn handle(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    store: Arc<Mutex<Vec<Event>>>,
    received: Arc<AtomicUsize>,
    feed: broadcast::Sender<Event>,
) {
    let (mut tx, mut rx) = ws.split();
    let mut live = feed.subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    loop {
        tokio::select! {
            msg = rx.next() => {
                let Some(Ok(TMsg::Text(txt))) = msg else { break };
                let Ok(val) = serde_json::from_str::<Value>(&txt) else { continue };
                let Some(arr) = val.as_array() else { continue };
                match arr.first().and_then(|v| v.as_str()) {
                    Some("EVENT") => {
                        received.fetch_add(1, Ordering::SeqCst);
                        let Ok(ev) = serde_json::from_value::<Event>(arr[1].clone()) else { continue };
                        let ok = ev.verify();
                        if ok {
                            let fresh = {
                                let mut events = store.lock().unwrap();
                                let fresh = !events.iter().any(|e| e.id() == ev.id());
                                if fresh {
                                    events.push(ev.clone());
                                }
                                fresh
                            };
                            if fresh {
                                let _ = feed.send(ev.clone());
                            }
                        }
                        let reply = json!(["OK", ev.id(), ok, if ok { "" } else { "invalid: bad signature" }]);
                        if tx.send(TMsg::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some("REQ") => {
                        let Some(id) = arr.get(1).and_then(|v| v.as_str()) else { continue };
                        let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_json).collect();
                        let matching: Vec<Event> = store
                            .lock()
                            .unwrap()
                            .iter()
                            .filter(|ev| filters.is_empty() || filters.iter().any(|f| f.matches(ev)))
                            .cloned()
                            .collect();
                        for ev in matching {
                            let frame = json!(["EVENT", id, ev]).to_string();
                            if tx.send(TMsg::Text(frame)).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(TMsg::Text(json!(["EOSE", id]).to_string())).await;
                        subs.insert(id.to_string(), filters);
                    }
                    Some("CLOSE") => {
                        if let Some(id) = arr.get(1).and_then(|v| v.as_str()) {
                            subs.remove(id);
                        }
                    }
                    _ => {}
                }
            }
            ev = live.recv() => {
                let Ok(ev) = ev else { continue };
                for (id, filters) in &subs {
                    if filters.is_empty() || filters.iter().any(|f| f.matches(&ev)) {
                        let frame = json!(["EVENT", id, ev]).to_string();
                        let _ = tx.send(TMsg::Text(frame)).await;
                    }
                }
            }
        }
    }
}
