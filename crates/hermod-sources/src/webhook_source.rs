//! Webhook/form receiver source (spec.md §2 component table: grouped with
//! broker sources — "form/webhook hubs", 8% share).
//!
//! An `axum` server accepts POSTed JSON bodies on the configured path,
//! validates an optional shared-secret header, and forwards each body as a
//! `create` `Message` through an internal channel that `read` drains. There
//! is no upstream watermark to advance — `ack` is a no-op, matching how the
//! teacher's stdout/debug sinks treat delivery as fire-and-forget.
//!
//! A webhook body carries no natural primary key, so each message is
//! assigned a random id on receipt rather than left empty.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes as AxumBytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hermod_core::config::WebhookSourceSpec;
use hermod_core::{HermodError, Message, Operation, Source};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SECRET_HEADER: &str = "x-hermod-secret";

struct ServerState {
    tx: mpsc::Sender<Message>,
    shared_secret: Option<String>,
}

pub struct WebhookSource {
    spec: WebhookSourceSpec,
    rx: Option<mpsc::Receiver<Message>>,
    server_task: Option<JoinHandle<()>>,
}

impl WebhookSource {
    pub fn new(spec: WebhookSourceSpec) -> Self {
        Self {
            spec,
            rx: None,
            server_task: None,
        }
    }

    async fn ensure_listening(&mut self) -> Result<(), HermodError> {
        if self.rx.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(256);
        let state = Arc::new(ServerState {
            tx,
            shared_secret: self.spec.shared_secret.clone(),
        });

        let app = Router::new()
            .route(&self.spec.path, post(receive))
            .with_state(state);

        let listener = TcpListener::bind(&self.spec.listen_addr)
            .await
            .map_err(|e| HermodError::Configuration(format!("bind {}: {e}", self.spec.listen_addr)))?;
        info!(addr = %self.spec.listen_addr, path = %self.spec.path, "webhook source listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "webhook server exited");
            }
        });

        self.rx = Some(rx);
        self.server_task = Some(handle);
        Ok(())
    }
}

async fn receive(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: AxumBytes,
) -> StatusCode {
    if let Some(expected) = &state.shared_secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            return StatusCode::UNAUTHORIZED;
        }
    }

    let mut msg = Message::default();
    msg.set_id(uuid::Uuid::new_v4().to_string())
        .set_operation(Operation::Create)
        .set_metadata("source", "webhook");
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&body) {
        msg.set_data(map.into_iter().collect());
    }
    msg.set_after(body.to_vec());
    msg.set_payload(body.to_vec());

    if state.tx.send(msg).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

#[async_trait]
impl Source for WebhookSource {
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, HermodError> {
        self.ensure_listening().await?;
        let rx = self.rx.as_mut().unwrap();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            item = rx.recv() => Ok(item),
        }
    }

    async fn ack(&mut self, _msg: &Message) -> Result<(), HermodError> {
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        if let Some(task) = self.server_task.take() {
            task.abort();
        }
        self.rx = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
