//! The coordinator (spec.md §4.10): ties one [`Source`] to its configured
//! [`Sink`]s.
//!
//! ## Task shape (spec.md §5)
//!
//! One reader task loops `Source::read` and pushes onto the ring buffer.
//! The calling task runs the writer loop: drain the ring buffer into
//! batches bounded by size or time, `WriteBatch` every sink in turn, and on
//! all-success `Ack` every message in the batch, in order, before moving to
//! the next batch. `Source` is shared between the two tasks behind a
//! `tokio::sync::Mutex` — reads and acks never happen concurrently, which
//! keeps ack monotonicity trivial to reason about without needing the
//! source itself to guard against concurrent calls.
//!
//! A single writer loop (rather than one task per sink, per §5's "or one
//! per configured batch-worker when parallelism > 1") is the simpler of
//! the two designs §5 allows and is what this crate implements; see
//! DESIGN.md.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hermod_core::config::EngineConfig;
use hermod_core::pool::MessagePool;
use hermod_core::{HermodError, Message, Sink, Source};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::metrics;
use crate::ring::{self, RingReceiver, RingSender};

pub struct Engine {
    source: Arc<Mutex<Box<dyn Source>>>,
    sinks: Vec<Box<dyn Sink>>,
    pool: Arc<MessagePool>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(source: Box<dyn Source>, sinks: Vec<Box<dyn Sink>>, config: EngineConfig) -> Self {
        let pool = Arc::new(MessagePool::new(config.ring_buffer_capacity));
        Self {
            source: Arc::new(Mutex::new(source)),
            sinks,
            pool,
            config,
        }
    }

    /// Run until `cancel` fires or a fatal [`HermodError::Configuration`]
    /// error surfaces from the source or a sink.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), HermodError> {
        if let Some(addr) = self.config.metrics_addr.clone() {
            match addr.parse() {
                Ok(addr) => {
                    if let Err(e) = metrics::serve(addr, cancel.clone()) {
                        warn!(error = %e, "failed to start metrics server");
                    }
                }
                Err(e) => warn!(error = %e, %addr, "invalid metrics_addr, skipping metrics server"),
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.wait_until_ready(&cancel).await?;
            if cancel.is_cancelled() {
                return Ok(());
            }

            let (tx, rx) = ring::channel(self.config.ring_buffer_capacity);
            let reader_source = self.source.clone();
            let reader_cancel = cancel.clone();
            let reader = tokio::spawn(reader_loop(reader_source, tx, reader_cancel));

            let writer_result = self.writer_loop(rx, &cancel).await;
            let reader_result = reader.await.unwrap_or(Ok(()));

            if let Err(e) = writer_result {
                if e.is_configuration() {
                    return Err(e);
                }
                warn!(error = %e, "writer loop exited; re-entering readiness");
            }
            if let Err(e) = reader_result {
                if e.is_configuration() {
                    return Err(e);
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// spec.md §4.10 step 1: call `IsReady` (which falls back to `Ping`
    /// internally when a source doesn't override it — spec.md §4.2), on
    /// error sleep `ReconnectInterval` and retry, logging status at most
    /// once per `StatusInterval`.
    async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<(), HermodError> {
        let mut last_status = Instant::now()
            .checked_sub(self.config.status_interval)
            .unwrap_or_else(Instant::now);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let ready = {
                let mut source = self.source.lock().await;
                source.is_ready().await
            };
            match ready {
                Ok(()) => {
                    info!("source ready");
                    return Ok(());
                }
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    if last_status.elapsed() >= self.config.status_interval {
                        warn!(error = %e, "source not ready");
                        last_status = Instant::now();
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn writer_loop(
        &mut self,
        mut rx: RingReceiver,
        cancel: &CancellationToken,
    ) -> Result<(), HermodError> {
        let mut backoff = Backoff::new(self.config.retry_backoff_initial, self.config.retry_backoff_max);

        loop {
            let Some(batch) = self.collect_batch(&mut rx, cancel).await else {
                return Ok(());
            };
            metrics::record_batch_size(batch.len());

            let mut attempt: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match self.deliver(&batch).await {
                    Ok(()) => {
                        backoff.reset();
                        self.ack_all(batch).await;
                        break;
                    }
                    Err(e) if e.is_configuration() => return Err(e),
                    Err(e) => {
                        attempt += 1;
                        metrics::record_retry();
                        warn!(error = %e, attempt, batch_len = batch.len(), "batch delivery failed");
                        if attempt >= self.config.max_retries {
                            error!(
                                batch_len = batch.len(),
                                "batch exceeded max_retries; dropping without ack"
                            );
                            for msg in batch {
                                self.pool.release(msg);
                            }
                            break;
                        }
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// spec.md §4.10 step 3's batching bound: size or time, whichever
    /// comes first. Returns `None` once the ring buffer is closed (reader
    /// gone) with nothing left to deliver.
    async fn collect_batch(
        &self,
        rx: &mut RingReceiver,
        cancel: &CancellationToken,
    ) -> Option<Vec<Message>> {
        let mut batch = Vec::new();
        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);

        loop {
            if batch.len() >= self.config.batch_size {
                return Some(batch);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return if batch.is_empty() { None } else { Some(batch) };
                }
                msg = rx.pop() => {
                    match msg {
                        Some(m) => batch.push(m),
                        None => return if batch.is_empty() { None } else { Some(batch) },
                    }
                }
                _ = &mut deadline, if !batch.is_empty() => {
                    return Some(batch);
                }
            }
        }
    }

    /// Invoke `WriteBatch` on every configured sink in turn. The first
    /// sink to fail aborts the rest of the batch for this attempt (spec.md
    /// §4.10 step 3: "on failure, stop acking from the first failure").
    async fn deliver(&mut self, batch: &[Message]) -> Result<(), HermodError> {
        for (idx, sink) in self.sinks.iter_mut().enumerate() {
            let start = Instant::now();
            let result = sink.write_batch(batch.to_vec()).await;
            metrics::record_sink_latency(&idx.to_string(), start.elapsed().as_secs_f64());
            result?;
        }
        Ok(())
    }

    async fn ack_all(&mut self, batch: Vec<Message>) {
        let mut source = self.source.lock().await;
        for msg in batch {
            if let Err(e) = source.ack(&msg).await {
                warn!(error = %e, id = msg.id(), "ack failed");
            } else {
                metrics::record_acked(1);
            }
            self.pool.release(msg);
        }
    }
}

/// The reader task: loop `Source::read`, push onto the ring buffer. Exits
/// with `Ok(())` on cancellation or once the writer side of the ring
/// buffer is gone; exits with `Err` (after closing the source) on any
/// non-cancellation read error, so the caller can decide whether to
/// propagate (fatal configuration) or re-enter readiness (everything
/// else).
async fn reader_loop(
    source: Arc<Mutex<Box<dyn Source>>>,
    tx: RingSender,
    cancel: CancellationToken,
) -> Result<(), HermodError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let read_result = {
            let mut source = source.lock().await;
            source.read(&cancel).await
        };
        match read_result {
            Ok(Some(msg)) => {
                metrics::record_read();
                if tx.push(msg).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {
                // "no data now; call again" (spec.md §4.2) — backoff hint.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(HermodError::Cancelled) => return Ok(()),
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!(error = %e, "source read error; closing and reconnecting");
                let mut source = source.lock().await;
                let _ = source.close().await;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hermod_core::config::EngineConfig;
    use hermod_core::{DeliveryOutcome, Operation};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecSource {
        ids: Vec<&'static str>,
        next: usize,
        acked: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Source for VecSource {
        async fn read(&mut self, _cancel: &CancellationToken) -> Result<Option<Message>, HermodError> {
            if self.next >= self.ids.len() {
                return Ok(None);
            }
            let id = self.ids[self.next];
            self.next += 1;
            let mut msg = Message::default();
            msg.set_id(id).set_operation(Operation::Create);
            Ok(Some(msg))
        }
        async fn ack(&mut self, msg: &Message) -> Result<(), HermodError> {
            self.acked.lock().unwrap().push(msg.id().to_string());
            Ok(())
        }
        async fn ping(&mut self) -> Result<(), HermodError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), HermodError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct FlakySink {
        fail_until: usize,
        attempts: AtomicUsize,
        received: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn write(&mut self, _msg: Message) -> Result<(), HermodError> {
            unreachable!("write_batch is used")
        }
        async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_until {
                return Err(HermodError::TransientIo(anyhow::anyhow!("not yet")));
            }
            let mut received = self.received.lock().unwrap();
            for m in &msgs {
                received.push(m.id().to_string());
            }
            Ok(())
        }
        async fn ping(&mut self) -> Result<(), HermodError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), HermodError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl hermod_core::sink::LastWriteIdempotent for FlakySink {
        fn last_write_idempotent(&self) -> DeliveryOutcome {
            DeliveryOutcome::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn at_least_once_then_ack_suppresses_redelivery() {
        let acked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        let source = Box::new(VecSource {
            ids: vec!["a", "b"],
            next: 0,
            acked: acked.clone(),
        });
        let sink = Box::new(FlakySink {
            fail_until: 2,
            attempts: AtomicUsize::new(0),
            received: received.clone(),
        });

        let mut config = EngineConfig::default();
        config.batch_size = 2;
        config.batch_timeout = Duration::from_millis(10);
        config.max_retries = 10;
        config.retry_backoff_initial = Duration::from_millis(1);
        config.retry_backoff_max = Duration::from_millis(4);

        let engine = Engine::new(source, vec![sink], config);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();

        let handle = tokio::spawn(engine.run(run_cancel));
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = handle.await;

        assert_eq!(*received.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(*acked.lock().unwrap(), vec!["a", "b"]);
    }
}
