//! Generic HTTP sink (spec.md §4.7's "notification/HTTP" family, wire
//! contract in §6): `POST` of a formatted body per message, or a single
//! `POST` of a JSON array when `batch_as_array` is set. `ping` issues a
//! configurable method (default `HEAD`); success is any 2xx.
//!
//! This is the shared shape every bespoke SaaS wrapper the spec calls out
//! (Discord, Twitter, ServiceNow, Salesforce, …) specializes — we implement
//! only the generic contract, per spec.md §1's "we specify only the
//! contract, not each integration body."

use std::str::FromStr;

use async_trait::async_trait;
use handlebars::Handlebars;
use hermod_core::config::HttpSinkSpec;
use hermod_core::{HermodError, Message, Sink};
use reqwest::{Client, Method};

pub struct HttpSink {
    spec: HttpSinkSpec,
    client: Client,
    renderer: Handlebars<'static>,
}

impl HttpSink {
    pub fn new(spec: HttpSinkSpec) -> Result<Self, HermodError> {
        let method = Method::from_str(&spec.method)
            .map_err(|e| HermodError::Configuration(format!("invalid http method {:?}: {e}", spec.method)))?;
        // validated eagerly so a bad method is a fatal config error, not a
        // per-message failure discovered on the first write.
        let _ = method;
        Ok(Self {
            spec,
            client: Client::new(),
            renderer: Handlebars::new(),
        })
    }

    fn render_context(msg: &Message) -> serde_json::Value {
        let mut ctx: serde_json::Map<String, serde_json::Value> =
            msg.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ctx.insert("id".into(), serde_json::Value::String(msg.id().to_string()));
        ctx.insert(
            "operation".into(),
            serde_json::Value::String(msg.operation().as_str().to_string()),
        );
        ctx.insert("table".into(), serde_json::Value::String(msg.table().to_string()));
        serde_json::Value::Object(ctx)
    }

    fn render_body(&self, msg: &Message) -> Result<serde_json::Value, HermodError> {
        match &self.spec.body_template {
            Some(template) => {
                let ctx = Self::render_context(msg);
                let rendered = self
                    .renderer
                    .render_template(template, &ctx)
                    .map_err(|e| HermodError::data(msg.id(), e))?;
                serde_json::from_str(&rendered).or(Ok(serde_json::Value::String(rendered)))
            }
            None => Ok(Self::render_context(msg)),
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<(), HermodError> {
        let method = Method::from_str(&self.spec.method).unwrap_or(Method::POST);
        let mut req = self
            .client
            .request(method, &self.spec.url)
            .header("Content-Type", "application/json")
            .json(&body);
        for (k, v) in &self.spec.headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if !resp.status().is_success() {
            return Err(HermodError::TransientIo(anyhow::anyhow!(
                "http sink received status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        let body = self.render_body(&msg)?;
        self.post(body).await
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        if !self.spec.batch_as_array {
            for msg in msgs {
                self.write(msg).await?;
            }
            return Ok(());
        }
        let mut array = Vec::with_capacity(msgs.len());
        for msg in &msgs {
            array.push(self.render_body(msg)?);
        }
        self.post(serde_json::Value::Array(array)).await
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        let method = self
            .spec
            .ping_method
            .as_deref()
            .map(Method::from_str)
            .transpose()
            .map_err(|e| HermodError::Configuration(format!("invalid ping method: {e}")))?
            .unwrap_or(Method::HEAD);
        let resp = self
            .client
            .request(method, &self.spec.url)
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(HermodError::TransientIo(anyhow::anyhow!(
                "http sink ping received status {}",
                resp.status()
            )))
        }
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
