//! Live update hub.
//!
//! WebSocket endpoint that multicasts derived state to subscribers and
//! serves historical queries straight from the store. Clients speak the
//! JSON protocol in [`protocol`]; every connection sees every `update`.

mod protocol;

pub use protocol::{ClientEvent, ServerEvent, TargetSummary, UpdatePayload};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_tungstenite::tungstenite::{
    self,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::scheduler::TrackerService;

const ADAPTER_STATUS_POLL_SECS: u64 = 5;

pub struct LiveHub {
    service: TrackerService,
    db: Database,
    events: broadcast::Sender<ServerEvent>,
    client_origin: Option<String>,
}

impl LiveHub {
    pub fn new(
        service: TrackerService,
        db: Database,
        updates: broadcast::Receiver<UpdatePayload>,
        client_origin: Option<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);

        let hub = Arc::new(Self {
            service,
            db,
            events,
            client_origin,
        });

        // Forward analysis updates into the subscriber event stream.
        let forwarder_events = hub.events.clone();
        let mut updates = updates;
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(payload) => {
                        let _ = forwarder_events.send(ServerEvent::Update(payload));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Update forwarder lagged, skipped {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        hub
    }

    pub async fn serve(self: Arc<Self>, port: u16, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind hub listener on port {port}"))?;
        info!("Live hub listening on port {port}");
        self.run(listener, cancel).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        self.spawn_status_watcher(cancel.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Live hub shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let hub = Arc::clone(&self);
                            tokio::spawn(async move {
                                hub.handle_connection(stream, peer).await;
                            });
                        }
                        Err(err) => {
                            warn!("Failed to accept subscriber connection: {err}");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Emit `adapter-status` whenever a bridge flips between available and
    /// unavailable. Probing halts on its own; this just tells clients why
    /// updates went quiet.
    fn spawn_status_watcher(&self, cancel: CancellationToken) {
        let service = self.service.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(ADAPTER_STATUS_POLL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: HashMap<_, bool> = HashMap::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for channel in service.channels() {
                            let available = service.channel_available(channel);
                            let changed = last_seen.insert(channel, available) != Some(available);
                            if changed {
                                let _ = events.send(ServerEvent::AdapterStatus { channel, available });
                            }
                        }
                    }
                }
            }
        });
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let expected_origin = self.client_origin.clone();
        let check_origin = move |request: &Request, response: Response| {
            let Some(expected) = expected_origin else {
                return Ok(response);
            };
            let presented = request
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok());
            if presented == Some(expected.as_str()) {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                Err(rejection)
            }
        };

        let websocket =
            match async_tungstenite::tokio::accept_hdr_async(stream, check_origin).await {
                Ok(websocket) => websocket,
                Err(err) => {
                    debug!("Subscriber handshake from {peer} failed: {err}");
                    return;
                }
            };

        info!("Subscriber connected from {peer}");
        let (mut sink, mut reader) = websocket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("Failed to serialize server event: {err}");
                        continue;
                    }
                };
                if sink.send(tungstenite::Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Fan the shared event stream into this connection's queue.
        let mut events_rx = self.events.subscribe();
        let events_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(event) => {
                        if events_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Subscriber lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(event) => self.handle_client_event(event, &tx).await,
                        Err(err) => {
                            debug!("Unparseable client event from {peer}: {err}");
                            let _ = tx.send(ServerEvent::Error {
                                message: "unrecognized request".to_string(),
                                target_id: None,
                            });
                        }
                    }
                }
                Ok(tungstenite::Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("Subscriber read error from {peer}: {err}");
                    break;
                }
            }
        }

        forwarder.abort();
        drop(tx);
        let _ = writer.await;
        info!("Subscriber disconnected ({peer})");
    }

    async fn handle_client_event(
        &self,
        event: ClientEvent,
        tx: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        match event {
            ClientEvent::AddTarget {
                identifier,
                channel,
            } => match self.service.add_target(&identifier, channel).await {
                Ok(record) => {
                    let display = self
                        .service
                        .get_display_metadata(&record.target_id, channel)
                        .await
                        .unwrap_or(None);
                    // Every subscriber learns about the new target.
                    let _ = self.events.send(ServerEvent::TargetAdded {
                        target_id: record.target_id,
                        channel,
                        identifier: record.identifier,
                        display,
                    });
                }
                Err(err) => {
                    let _ = tx.send(ServerEvent::Error {
                        message: err.to_string(),
                        target_id: None,
                    });
                }
            },
            ClientEvent::RemoveTarget { target_id } => {
                match self.service.remove_target(&target_id).await {
                    Ok(_) => {
                        let _ = self.events.send(ServerEvent::TargetRemoved { target_id });
                    }
                    Err(err) => {
                        let _ = tx.send(ServerEvent::Error {
                            message: err.to_string(),
                            target_id: Some(target_id),
                        });
                    }
                }
            }
            ClientEvent::ListTargets => {
                let mut targets = Vec::new();
                for record in self.service.list_targets().await {
                    let latest = self
                        .db
                        .get_latest_analysis(&record.target_id)
                        .await
                        .unwrap_or(None);
                    targets.push(TargetSummary {
                        target_id: record.target_id,
                        channel: record.channel,
                        identifier: record.identifier,
                        state: latest.as_ref().map(|analysis| analysis.derived_state),
                        confidence: latest.as_ref().map(|analysis| analysis.confidence_score),
                    });
                }
                let _ = tx.send(ServerEvent::Targets { targets });
            }
            ClientEvent::GetAvailableDays { target_id } => {
                match self.db.get_available_days(&target_id).await {
                    Ok(days) => {
                        let _ = tx.send(ServerEvent::AvailableDays { target_id, days });
                    }
                    Err(err) => {
                        debug!("Day listing failed for {target_id}: {err:?}");
                        let _ = tx.send(ServerEvent::Error {
                            message: "could not list available days".to_string(),
                            target_id: Some(target_id),
                        });
                    }
                }
            }
            ClientEvent::GetRawForDay { target_id, day } => {
                match self.db.get_raw_for_day(&target_id, &day).await {
                    Ok(rows) => {
                        let _ = tx.send(ServerEvent::RawForDay {
                            target_id,
                            day,
                            rows,
                        });
                    }
                    Err(err) => {
                        debug!("Raw-day query failed for {target_id}: {err:?}");
                        let _ = tx.send(ServerEvent::Error {
                            message: "could not load measurements for that day".to_string(),
                            target_id: Some(target_id),
                        });
                    }
                }
            }
            ClientEvent::SetProbeMethod { method } => {
                self.service.set_probe_method(method).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::adapters::{
        AdapterError, Channel, DisplayMetadata, PlatformAdapter, ProbeMethod, ProbeTicket, Receipt,
    };
    use crate::analysis::AnalysisEngine;
    use crate::netmon::NetworkMonitor;
    use crate::utils::clock;

    struct IdleAdapter {
        counter: AtomicU64,
        receipts_tx: StdMutex<Option<mpsc::UnboundedSender<Receipt>>>,
    }

    impl IdleAdapter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicU64::new(0),
                receipts_tx: StdMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl PlatformAdapter for IdleAdapter {
        fn channel(&self) -> Channel {
            Channel::Whatsapp
        }

        fn is_available(&self) -> bool {
            false
        }

        fn resolve_target(&self, identifier: &str) -> Result<String, AdapterError> {
            crate::adapters::normalize_phone(identifier)
                .map(|digits| format!("{digits}@s.whatsapp.net"))
        }

        async fn send_probe(
            &self,
            _target_id: &str,
            _method: ProbeMethod,
        ) -> Result<ProbeTicket, AdapterError> {
            Ok(ProbeTicket {
                token: format!("probe-{}", self.counter.fetch_add(1, Ordering::SeqCst)),
                sent_at_ms: clock::now_ms(),
            })
        }

        fn subscribe_receipts(&self) -> mpsc::UnboundedReceiver<Receipt> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.receipts_tx.lock().unwrap() = Some(tx);
            rx
        }

        async fn get_display_metadata(
            &self,
            _target_id: &str,
        ) -> Result<Option<DisplayMetadata>, AdapterError> {
            Ok(None)
        }
    }

    async fn start_hub() -> (tempfile::TempDir, CancellationToken, String) {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("tracker.db")).expect("open db");
        let monitor = NetworkMonitor::new(db.clone(), "127.0.0.1:1");
        let (updates_tx, updates_rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (analysis, _engine) = AnalysisEngine::spawn(db.clone(), updates_tx, cancel.clone());
        let service = TrackerService::new(
            db.clone(),
            monitor,
            analysis,
            vec![IdleAdapter::new() as Arc<dyn PlatformAdapter>],
        );

        let hub = LiveHub::new(service, db, updates_rx, None);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(hub.run(listener, cancel.clone()));

        (dir, cancel, format!("ws://{addr}"))
    }

    async fn next_reply<S>(websocket: &mut S) -> ServerEvent
    where
        S: futures::Stream<
                Item = Result<tungstenite::Message, tungstenite::Error>,
            > + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), websocket.next())
                .await
                .expect("reply deadline")
                .expect("stream open")
                .expect("frame");
            if let tungstenite::Message::Text(text) = frame {
                let event: ServerEvent =
                    serde_json::from_str(text.as_str()).expect("parse server event");
                // Background pushes can interleave with the reply.
                if matches!(
                    event,
                    ServerEvent::AdapterStatus { .. } | ServerEvent::Update(_)
                ) {
                    continue;
                }
                return event;
            }
        }
    }

    async fn request_reply(url: &str, request: &ClientEvent) -> ServerEvent {
        let (mut websocket, _) = async_tungstenite::tokio::connect_async(url)
            .await
            .expect("connect");
        let text = serde_json::to_string(request).expect("serialize");
        websocket
            .send(tungstenite::Message::Text(text.into()))
            .await
            .expect("send");

        next_reply(&mut websocket).await
    }

    #[tokio::test]
    async fn list_targets_round_trips_over_websocket() {
        let (_dir, cancel, url) = start_hub().await;

        let reply = request_reply(&url, &ClientEvent::ListTargets).await;
        assert!(matches!(reply, ServerEvent::Targets { ref targets } if targets.is_empty()));

        cancel.cancel();
    }

    #[tokio::test]
    async fn add_target_is_announced_and_listed() {
        let (_dir, cancel, url) = start_hub().await;

        let reply = request_reply(
            &url,
            &ClientEvent::AddTarget {
                identifier: "+1 555 987 6543".to_string(),
                channel: Channel::Whatsapp,
            },
        )
        .await;
        match reply {
            ServerEvent::TargetAdded {
                target_id, channel, ..
            } => {
                assert_eq!(target_id, "15559876543@s.whatsapp.net");
                assert_eq!(channel, Channel::Whatsapp);
            }
            other => panic!("expected target-added, got {other:?}"),
        }

        let reply = request_reply(&url, &ClientEvent::ListTargets).await;
        assert!(matches!(reply, ServerEvent::Targets { ref targets } if targets.len() == 1));

        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_requests_get_a_clean_error() {
        let (_dir, cancel, url) = start_hub().await;

        let (mut websocket, _) = async_tungstenite::tokio::connect_async(url.as_str())
            .await
            .expect("connect");
        websocket
            .send(tungstenite::Message::Text("not json".to_string().into()))
            .await
            .expect("send");

        let event = next_reply(&mut websocket).await;
        assert!(matches!(event, ServerEvent::Error { ref message, .. }
            if message == "unrecognized request"));

        cancel.cancel();
    }
}
