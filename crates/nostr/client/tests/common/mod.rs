//! Scriptable in-process relay for integration tests.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr::Event;
use nostr_client::{Filter, matches_any};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Once;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// How the relay answers `EVENT`.
#[derive(Debug, Clone)]
pub enum OnEvent {
    Accept,
    Reject(String),
    /// Never answer
    Silent,
    /// Reject with `auth-required:` and challenge until an AUTH succeeds
    RequireAuth,
}

#[derive(Default)]
struct State {
    stored: Vec<Event>,
    received: Vec<Value>,
    authed: bool,
}

pub struct MockRelay {
    pub url: String,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockRelay {
    pub async fn start(on_event: OnEvent) -> Self {
        Self::with_events(on_event, vec![]).await
    }

    /// Start a relay that serves `stored` to matching REQs.
    pub async fn with_events(on_event: OnEvent, stored: Vec<Event>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State {
            stored,
            ..Default::default()
        }));

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = state.clone();
                    let on_event = on_event.clone();
                    tokio::spawn(async move {
                        if let Ok(ws) = accept_async(stream).await {
                            serve(ws, state, on_event).await;
                        }
                    });
                }
            })
        };

        Self {
            url: format!("ws://127.0.0.1:{}/", port),
            state,
            task,
        }
    }

    /// Every client frame of the given type, in arrival order.
    pub fn received(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|frame| frame[0] == kind)
            .cloned()
            .collect()
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<Mutex<State>>,
    on_event: OnEvent,
) {
    let (mut sink, mut stream) = ws.split();
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else { continue };
        state.lock().received.push(frame.clone());

        let replies = respond(&frame, &state, &on_event);
        for reply in replies {
            if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

fn respond(frame: &Value, state: &Mutex<State>, on_event: &OnEvent) -> Vec<Value> {
    match frame[0].as_str() {
        Some("EVENT") => {
            let id = frame[1]["id"].clone();
            match on_event {
                OnEvent::Accept => vec![json!(["OK", id, true, ""])],
                OnEvent::Reject(reason) => vec![json!(["OK", id, false, reason])],
                OnEvent::Silent => vec![],
                OnEvent::RequireAuth if state.lock().authed => vec![json!(["OK", id, true, ""])],
                OnEvent::RequireAuth => vec![
                    json!(["OK", id, false, "auth-required: publishing needs auth"]),
                    json!(["AUTH", "challenge-abc"]),
                ],
            }
        }
        Some("AUTH") => {
            state.lock().authed = true;
            vec![json!(["OK", frame[1]["id"].clone(), true, ""])]
        }
        Some("REQ") => {
            let Some(sub_id) = frame[1].as_str() else { return vec![] };
            let filters: Vec<Filter> = frame
                .as_array()
                .map(|items| {
                    items[2..]
                        .iter()
                        .filter_map(|f| serde_json::from_value(f.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            let mut replies: Vec<Value> = state
                .lock()
                .stored
                .iter()
                .filter(|event| matches_any(&filters, event))
                .map(|event| json!(["EVENT", sub_id, event]))
                .collect();
            replies.push(json!(["EOSE", sub_id]));
            replies
        }
        Some("COUNT") => {
            let Some(sub_id) = frame[1].as_str() else { return vec![] };
            let count = state.lock().stored.len();
            vec![json!(["COUNT", sub_id, {"count": count}])]
        }
        _ => vec![],
    }
}
