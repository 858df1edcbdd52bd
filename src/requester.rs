//! Request/response correlation and unsolicited-message routing over a
//! single LEAP connection. One task (`Requester::run`) owns the connection's
//! read loop; callers issue requests through `Requester::request` and
//! suspend on a oneshot channel until the router completes it by tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::error::{LeapError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct LeapRequest {
    #[serde(rename = "CommuniqueType")]
    pub communique_type: String,
    #[serde(rename = "Header")]
    pub header: LeapRequestHeader,
    #[serde(rename = "Body", skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeapRequestHeader {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "ClientTag", skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

/// A decoded response or unsolicited notification.
#[derive(Debug, Clone)]
pub struct LeapMessage {
    pub communique_type: String,
    pub url: String,
    pub status_code: Option<String>,
    pub client_tag: Option<String>,
    pub body: serde_json::Value,
}

impl LeapMessage {
    fn from_value(v: &serde_json::Value) -> Option<Self> {
        let communique_type = v.get("CommuniqueType")?.as_str()?.to_string();
        let header = v.get("Header")?;
        let url = header
            .get("Url")
            .and_then(|u| u.as_str())
            .unwrap_or_default()
            .to_string();
        let status_code = header
            .get("StatusCode")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
        let client_tag = header
            .get("ClientTag")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());
        let body = v.get("Body").cloned().unwrap_or(serde_json::Value::Null);
        Some(Self {
            communique_type,
            url,
            status_code,
            client_tag,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status_code
            .as_deref()
            .map(|c| c.starts_with('2'))
            .unwrap_or(true)
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<LeapMessage>>>>>;
type Subscribers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LeapMessage>>>>;

/// Internal command sent to the writer task: either a tagged request or a
/// shutdown signal.
enum WriteJob {
    Request(LeapRequest, oneshot::Sender<Result<LeapMessage>>),
    Close,
}

/// Handle used by callers to send requests and register URL subscriptions.
/// Cloning is cheap; every clone talks to the same underlying connection.
#[derive(Clone)]
pub struct Requester {
    write_tx: mpsc::UnboundedSender<WriteJob>,
    pending: PendingMap,
    subscribers: Subscribers,
    next_tag: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl Requester {
    /// Take ownership of `conn`, split it, and spawn the reader/writer tasks
    /// that drive it. Returns a cloneable handle plus a join handle for the
    /// reader task (the caller awaits it to detect connection loss).
    pub fn spawn(
        conn: Connection,
        request_timeout: Duration,
    ) -> (Self, tokio::task::JoinHandle<Result<()>>) {
        let (reader, writer) = conn.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (write_tx, write_rx) = mpsc::unbounded_channel::<WriteJob>();

        let this = Self {
            write_tx,
            pending: pending.clone(),
            subscribers: subscribers.clone(),
            next_tag: Arc::new(AtomicU64::new(1)),
            request_timeout,
        };

        let join = tokio::spawn(run_io(reader, writer, write_rx, pending, subscribers));
        (this, join)
    }

    /// Send `communique_type`/`url`/`body` and await the matching response,
    /// bounded by the requester's configured timeout.
    pub async fn request(
        &self,
        communique_type: &str,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<LeapMessage> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        let req = LeapRequest {
            communique_type: communique_type.to_string(),
            header: LeapRequestHeader {
                url: url.to_string(),
                client_tag: Some(tag.clone()),
            },
            body,
        };
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteJob::Request(req, tx))
            .map_err(|_| LeapError::ConnectionClosed)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LeapError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&tag);
                Err(LeapError::Timeout {
                    url: url.to_string(),
                })
            }
        }
    }

    /// Subscribe to a URL; the bridge streams `ReadResponse` notifications
    /// with this URL after the initial `SubscribeResponse`. Returns the
    /// initial response body plus a channel of subsequent notifications.
    ///
    /// The subscriber channel is registered before the request is even sent,
    /// not after the initial response resolves: the read loop and this call
    /// run on different tasks, and a bridge that pushes its first
    /// notification immediately after acking the subscription could
    /// otherwise race ahead of us installing the handler.
    pub async fn subscribe(
        &self,
        url: &str,
    ) -> Result<(LeapMessage, mpsc::UnboundedReceiver<LeapMessage>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.insert(url.to_string(), tx);
        let initial = self.request("SubscribeRequest", url, None).await?;
        Ok((initial, rx))
    }

    /// Fire a request with no response expected to be awaited beyond
    /// delivery acknowledgement — used for commands where the caller only
    /// cares that the bridge accepted it.
    pub async fn execute(&self, url: &str, body: serde_json::Value) -> Result<LeapMessage> {
        self.request("CreateRequest", url, Some(body)).await
    }

    pub async fn read(&self, url: &str) -> Result<LeapMessage> {
        self.request("ReadRequest", url, None).await
    }

    pub async fn update(&self, url: &str, body: serde_json::Value) -> Result<LeapMessage> {
        self.request("UpdateRequest", url, Some(body)).await
    }

    /// Close the connection; all pending requests resolve with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.write_tx.send(WriteJob::Close);
    }
}

async fn run_io(
    mut reader: ConnectionReader,
    mut writer: ConnectionWriter,
    mut write_rx: mpsc::UnboundedReceiver<WriteJob>,
    pending: PendingMap,
    subscribers: Subscribers,
) -> Result<()> {
    let result = loop {
        tokio::select! {
            line = reader.read_line() => {
                match line {
                    Ok(Some(value)) => {
                        dispatch(&value, &pending, &subscribers).await;
                    }
                    Ok(None) => {
                        debug!("LEAP connection closed by peer");
                        break Ok(());
                    }
                    Err(e) => {
                        break Err(e);
                    }
                }
            }
            job = write_rx.recv() => {
                match job {
                    Some(WriteJob::Request(req, completion)) => {
                        let tag = req.header.client_tag.clone();
                        if let Some(tag) = tag {
                            pending.lock().await.insert(tag, completion);
                        }
                        if let Err(e) = writer.write_line(&req).await {
                            break Err(e);
                        }
                    }
                    Some(WriteJob::Close) | None => {
                        break Ok(());
                    }
                }
            }
        }
    };

    // Resolve every still-pending caller with ConnectionClosed.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(LeapError::ConnectionClosed));
    }
    drop(pending);
    let _ = writer.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leap_message_success_status_defaults_true() {
        let v = serde_json::json!({"CommuniqueType":"ReadResponse","Header":{"Url":"/area"},"Body":{}});
        let msg = LeapMessage::from_value(&v).unwrap();
        assert!(msg.is_success());
    }

    #[test]
    fn leap_message_detects_non_2xx() {
        let v = serde_json::json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"Url": "/area", "StatusCode": "404 Not Found"},
            "Body": {}
        });
        let msg = LeapMessage::from_value(&v).unwrap();
        assert!(!msg.is_success());
    }

    #[tokio::test]
    async fn dispatch_resolves_pending_request_by_tag() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("7".to_string(), tx);

        let value = serde_json::json!({
            "CommuniqueType": "CreateResponse",
            "Header": {"Url": "/zone/1/commandprocessor", "StatusCode": "201 Created", "ClientTag": "7"},
            "Body": {}
        });
        dispatch(&value, &pending, &subscribers).await;

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.url, "/zone/1/commandprocessor");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_routes_unsolicited_message_to_subscriber() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.lock().await.insert("/zone/status".to_string(), tx);

        let value = serde_json::json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"Url": "/zone/status"},
            "Body": {"ZoneStatus": {"Level": 50, "Zone": {"href": "/zone/1"}}}
        });
        dispatch(&value, &pending, &subscribers).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.body["ZoneStatus"]["Level"], 50);
    }

    #[tokio::test]
    async fn dispatch_maps_non_2xx_status_to_bridge_error() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("3".to_string(), tx);

        let value = serde_json::json!({
            "CommuniqueType": "CreateResponse",
            "Header": {"Url": "/zone/9/commandprocessor", "StatusCode": "404 Not Found", "ClientTag": "3"},
            "Body": {}
        });
        dispatch(&value, &pending, &subscribers).await;

        match rx.await.unwrap() {
            Err(LeapError::BridgeError { code, url }) => {
                assert_eq!(code, "404 Not Found");
                assert_eq!(url, "/zone/9/commandprocessor");
            }
            other => panic!("expected BridgeError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_ignores_unsolicited_message_with_no_subscriber() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        let value = serde_json::json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"Url": "/occupancygroup/status"},
            "Body": {}
        });
        // Should not panic despite nobody listening.
        dispatch(&value, &pending, &subscribers).await;
    }

    #[tokio::test]
    async fn dispatch_routes_per_entity_notification_to_base_url_subscriber() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.lock().await.insert("/zone/status".to_string(), tx);

        // Bridges push per-zone notifications on `/zone/<id>/status`, not the
        // `/zone/status` URL the subscription itself was made on.
        let value = serde_json::json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"Url": "/zone/1/status"},
            "Body": {"ZoneStatus": {"Level": 50, "Zone": {"href": "/zone/1"}}}
        });
        dispatch(&value, &pending, &subscribers).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.url, "/zone/1/status");
        assert_eq!(msg.body["ZoneStatus"]["Level"], 50);
    }

    #[tokio::test]
    async fn dispatch_routes_occupancy_group_notification_to_base_url_subscriber() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers
            .lock()
            .await
            .insert("/occupancygroup/status".to_string(), tx);

        let value = serde_json::json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"Url": "/occupancygroup/4/status"},
            "Body": {"OccupancyGroupStatus": {"OccupancyStatus": "Occupied"}}
        });
        dispatch(&value, &pending, &subscribers).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.url, "/occupancygroup/4/status");
    }

    #[test]
    fn is_path_prefix_matches_entity_id_inserted_before_tail_segment() {
        assert!(is_path_prefix("/zone/status", "/zone/1/status"));
        assert!(is_path_prefix(
            "/occupancygroup/status",
            "/occupancygroup/4/status"
        ));
        assert!(is_path_prefix("/zone/status", "/zone/status"));
    }

    #[test]
    fn is_path_prefix_rejects_unrelated_or_malformed_urls() {
        assert!(!is_path_prefix("/zone/status", "/device/status"));
        assert!(!is_path_prefix("/zone/status", "/zone/1/2/status"));
        assert!(!is_path_prefix("/zone/status", "/zone/1"));
    }
}

async fn dispatch(value: &serde_json::Value, pending: &PendingMap, subscribers: &Subscribers) {
    let msg = match LeapMessage::from_value(value) {
        Some(m) => m,
        None => {
            warn!("discarding message with unrecognized envelope: {}", value);
            return;
        }
    };

    if let Some(tag) = &msg.client_tag {
        let mut pending_guard = pending.lock().await;
        if let Some(tx) = pending_guard.remove(tag) {
            drop(pending_guard);
            let result = if msg.is_success() {
                Ok(msg)
            } else {
                Err(LeapError::BridgeError {
                    code: msg.status_code.clone().unwrap_or_default(),
                    url: msg.url.clone(),
                })
            };
            let _ = tx.send(result);
            return;
        }
    }

    let subs = subscribers.lock().await;
    match find_subscriber(&subs, &msg.url) {
        Some(tx) => {
            trace!("routing unsolicited message for {}", msg.url);
            let _ = tx.send(msg);
        }
        None => debug!("no subscriber for unsolicited url {}", msg.url),
    }
}

/// Resolve a subscriber for `url`, by exact match on the subscribed base URL
/// or, failing that, by the base URL being a path-prefix of `url` (e.g. a
/// subscription on `/zone/status` matches a notification on
/// `/zone/1/status`, which is the per-entity shape bridges actually push).
/// Prefers the longest matching base URL when more than one prefix matches.
fn find_subscriber<'a>(
    subs: &'a HashMap<String, mpsc::UnboundedSender<LeapMessage>>,
    url: &str,
) -> Option<&'a mpsc::UnboundedSender<LeapMessage>> {
    if let Some(tx) = subs.get(url) {
        return Some(tx);
    }
    subs.iter()
        .filter(|(base, _)| is_path_prefix(base, url))
        .max_by_key(|(base, _)| base.len())
        .map(|(_, tx)| tx)
}

/// True if `base` is a path-prefix of `url` in the sense LEAP subscriptions
/// use it: `base`'s segments are a leading subsequence of `url`'s segments,
/// e.g. `/zone/status` prefixes `/zone/1/status` (insert the entity id
/// between the topic and its tail segment) and `/occupancygroup/status`
/// prefixes `/occupancygroup/4/status`.
fn is_path_prefix(base: &str, url: &str) -> bool {
    if base == url {
        return true;
    }
    let base_segments: Vec<&str> = base.trim_matches('/').split('/').collect();
    let url_segments: Vec<&str> = url.trim_matches('/').split('/').collect();
    if url_segments.len() <= base_segments.len() {
        return false;
    }
    // The base's segments must all appear, in order, within the url's
    // segments, with exactly one extra (the entity id) inserted somewhere.
    if base_segments.len() + 1 != url_segments.len() {
        return false;
    }
    let mut bi = 0;
    for seg in &url_segments {
        if bi < base_segments.len() && *seg == base_segments[bi] {
            bi += 1;
        }
    }
    bi == base_segments.len()
}
