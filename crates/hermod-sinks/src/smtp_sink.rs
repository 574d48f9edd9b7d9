//! SMTP sink: templated, idempotent notification delivery (spec.md §4.8,
//! worked example §8.3).
//!
//! Templates render against a merged context: `msg.data()`, `after`
//! flattened into the same map, plus a few system fields (`id`,
//! `operation`, `table`). `template_source=url`/`s3` fetch the template
//! body once (cached for the sink's lifetime) via `reqwest` — `s3` is
//! served as a plain HTTPS GET against the object's virtual-hosted URL
//! rather than pulling in the AWS SDK, since nothing else in this stack
//! needs it.

use std::collections::HashMap;

use async_trait::async_trait;
use fnv::FnvHasher;
use handlebars::Handlebars;
use hermod_core::config::{SmtpIdempotencyPolicy, SmtpSinkSpec, TemplateSource};
use hermod_core::evaluator::get_msg_val_by_path;
use hermod_core::sink::{DeliveryOutcome, LastWriteIdempotent};
use hermod_core::{HermodError, IdempotencyStore, Message, Sink};
use hermod_idempotency::SqliteIdempotencyStore;
use lettre::message::Message as MailMessage;
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::{AsyncTransport, Tokio1Executor};
use std::hash::Hasher;
use tracing::{debug, info};

pub struct SmtpSink {
    spec: SmtpSinkSpec,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    idempotency: Option<SqliteIdempotencyStore>,
    renderer: Handlebars<'static>,
    subject_template: String,
    body_template: String,
    last_outcome: DeliveryOutcome,
}

impl SmtpSink {
    pub async fn connect(spec: SmtpSinkSpec) -> Result<Self, HermodError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(&spec.smtp_url)
            .map_err(|e| HermodError::Configuration(e.to_string()))?
            .build();

        let idempotency = if spec.idempotency_enabled {
            Some(
                SqliteIdempotencyStore::open(&spec.idempotency_db_path)
                    .await
                    .map_err(|e| HermodError::Configuration(e.to_string()))?,
            )
        } else {
            None
        };

        let (subject_template, body_template) = resolve_templates(&spec).await?;

        Ok(Self {
            spec,
            transport,
            idempotency,
            renderer: Handlebars::new(),
            subject_template,
            body_template,
            last_outcome: DeliveryOutcome::default(),
        })
    }

    fn render_context(&self, msg: &Message) -> HashMap<String, serde_json::Value> {
        let mut ctx: HashMap<String, serde_json::Value> = msg
            .data()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Ok(serde_json::Value::Object(after)) = serde_json::from_slice::<serde_json::Value>(msg.after()) {
            for (k, v) in after {
                ctx.entry(k).or_insert(v);
            }
        }
        ctx.insert("id".to_string(), serde_json::Value::String(msg.id().to_string()));
        ctx.insert(
            "operation".to_string(),
            serde_json::Value::String(msg.operation().as_str().to_string()),
        );
        ctx.insert("table".to_string(), serde_json::Value::String(msg.table().to_string()));
        ctx
    }

    fn resolve_recipients(&self, msg: &Message) -> Vec<String> {
        get_msg_val_by_path(msg, &self.spec.to_field)
            .map(|v| match v {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect(),
                serde_json::Value::String(s) => vec![s],
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    fn idempotency_key(&self, msg: &Message, subject: &str, to: &[String], body: &str) -> Option<String> {
        if !self.spec.idempotency_enabled {
            return None;
        }
        if let Some(template) = &self.spec.idempotency_key_template {
            let ctx = self.render_context(msg);
            return self.renderer.render_template(template, &ctx).ok();
        }
        let to_normalized = to
            .iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(",");
        let fingerprint = format!("{}|{}|{}|{}", msg.id(), subject.to_ascii_lowercase(), to_normalized, body);
        Some(format!("{:032x}", fnv1a_128(fingerprint.as_bytes())))
    }
}

/// A 128-bit fingerprint from two independent 64-bit FNV-1a passes (spec.md
/// §4.8's "128-bit FNV-1a hash of (id | lower(subject) | ...)"): the first
/// pass hashes `data` with the crate's default offset basis, the second
/// seeds `FnvHasher::with_key` with the first pass's digest so the two
/// halves aren't the same 64 bits repeated.
fn fnv1a_128(data: &[u8]) -> u128 {
    let mut low = FnvHasher::default();
    low.write(data);
    let low = low.finish();

    let mut high = FnvHasher::with_key(low.swap_bytes());
    high.write(data);
    let high = high.finish();

    ((high as u128) << 64) | low as u128
}

async fn resolve_templates(spec: &SmtpSinkSpec) -> Result<(String, String), HermodError> {
    match spec.template_source {
        TemplateSource::Inline => Ok((spec.subject_template.clone(), spec.body_template.clone())),
        TemplateSource::Url | TemplateSource::S3 => {
            let client = reqwest::Client::new();
            let subject = fetch_template(&client, &spec.subject_template).await?;
            let body = fetch_template(&client, &spec.body_template).await?;
            Ok((subject, body))
        }
    }
}

async fn fetch_template(client: &reqwest::Client, url: &str) -> Result<String, HermodError> {
    client
        .get(url)
        .send()
        .await
        .map_err(|e| HermodError::Configuration(format!("fetch template {url}: {e}")))?
        .text()
        .await
        .map_err(|e| HermodError::Configuration(format!("read template {url}: {e}")))
}

#[async_trait]
impl Sink for SmtpSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        let ctx = self.render_context(&msg);
        let subject = self
            .renderer
            .render_template(&self.subject_template, &ctx)
            .map_err(|e| HermodError::data(msg.id(), e))?;
        let body = self
            .renderer
            .render_template(&self.body_template, &ctx)
            .map_err(|e| HermodError::data(msg.id(), e))?;
        let to = self.resolve_recipients(&msg);
        if to.is_empty() {
            return Err(HermodError::Configuration(format!(
                "no recipients resolved from field {:?}",
                self.spec.to_field
            )));
        }

        let key = self.idempotency_key(&msg, &subject, &to, &body);

        if let (Some(store), Some(key)) = (&self.idempotency, &key) {
            if matches!(self.spec.idempotency_policy, SmtpIdempotencyPolicy::ClaimBeforeSend) {
                let claimed = store
                    .claim(key)
                    .await
                    .map_err(|e| HermodError::TransientIo(e))?;
                if !claimed {
                    debug!(key, "smtp send deduplicated");
                    self.last_outcome = DeliveryOutcome { dedup: true, conflict: false };
                    return Ok(());
                }
            }
        }

        let mut builder = MailMessage::builder()
            .from(self.spec.from.parse().map_err(|e: lettre::address::AddressError| {
                HermodError::Configuration(e.to_string())
            })?)
            .subject(subject);
        for addr in &to {
            builder = builder.to(addr.parse().map_err(|e: lettre::address::AddressError| {
                HermodError::Configuration(e.to_string())
            })?);
        }
        let email = builder
            .body(body)
            .map_err(|e| HermodError::data(msg.id(), e))?;

        let send_result = self.transport.send(email).await;

        if let (Some(store), Some(key)) = (&self.idempotency, &key) {
            match (&send_result, self.spec.idempotency_policy) {
                (Ok(_), SmtpIdempotencyPolicy::ClaimBeforeSend) => {
                    store.mark_sent(key).await.map_err(HermodError::TransientIo)?;
                }
                (Ok(_), SmtpIdempotencyPolicy::ClaimAfterSend) => {
                    let claimed = store.claim(key).await.map_err(HermodError::TransientIo)?;
                    if claimed {
                        store.mark_sent(key).await.map_err(HermodError::TransientIo)?;
                    } else {
                        self.last_outcome = DeliveryOutcome { dedup: true, conflict: true };
                        return Ok(());
                    }
                }
                (Err(_), _) => {
                    // Claim (if any, under ClaimBeforeSend) is left un-marked so a
                    // retry can attempt to send again; see SmtpIdempotencyPolicy.
                }
            }
        }

        send_result.map_err(|e| HermodError::data(msg.id(), e))?;
        self.last_outcome = DeliveryOutcome::default();
        info!(to = ?to, "smtp message sent");
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        use lettre::AsyncTransport as _;
        self.transport
            .test_connection()
            .await
            .map(|_| ())
            .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl LastWriteIdempotent for SmtpSink {
    fn last_write_idempotent(&self) -> DeliveryOutcome {
        self.last_outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_128_is_deterministic_and_uses_full_width() {
        let a = fnv1a_128(b"m1|hi|a@x|hello");
        let b = fnv1a_128(b"m1|hi|a@x|hello");
        assert_eq!(a, b);

        let low = a as u64;
        let high = (a >> 64) as u64;
        assert_ne!(low, high, "high half must not just repeat the low half");

        let different = fnv1a_128(b"m2|hi|a@x|hello");
        assert_ne!(a, different);
    }

    #[test]
    fn fnv1a_128_formats_to_32_hex_chars() {
        let key = format!("{:032x}", fnv1a_128(b"fingerprint"));
        assert_eq!(key.len(), 32);
    }
}
