//! FTP sink (spec.md §2 component table, §5): uploads each message's
//! formatted payload as one file under `remote_dir`. `ping` issues `NOOP`;
//! on failure it quits the stale control connection and redials before the
//! next write, matching spec.md §5's "`Ping` may reopen after transient
//! errors (e.g., FTP NOOP failure → quit + redial)".

use async_trait::async_trait;
use hermod_core::config::FtpSinkSpec;
use hermod_core::{HermodError, Message, Sink};
use suppaftp::AsyncFtpStream;

pub struct FtpSink {
    spec: FtpSinkSpec,
    stream: Option<AsyncFtpStream>,
}

impl FtpSink {
    pub fn new(spec: FtpSinkSpec) -> Self {
        Self { spec, stream: None }
    }

    async fn connect(&self) -> Result<AsyncFtpStream, HermodError> {
        let mut stream = AsyncFtpStream::connect(format!("{}:{}", self.spec.host, self.spec.port))
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        stream
            .login(&self.spec.username, &self.spec.password)
            .await
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        if !self.spec.remote_dir.is_empty() {
            stream
                .cwd(&self.spec.remote_dir)
                .await
                .map_err(|e| HermodError::Configuration(e.to_string()))?;
        }
        Ok(stream)
    }

    async fn ensure_connected(&mut self) -> Result<&mut AsyncFtpStream, HermodError> {
        if self.stream.is_none() {
            self.stream = Some(self.connect().await?);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    fn payload(msg: &Message) -> Vec<u8> {
        if !msg.after().is_empty() {
            return msg.after().to_vec();
        }
        let value = serde_json::Value::Object(
            msg.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

#[async_trait]
impl Sink for FtpSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        let filename = format!("{}.json", msg.id());
        let payload = Self::payload(&msg);
        let stream = self.ensure_connected().await?;
        let mut cursor = std::io::Cursor::new(payload);
        stream
            .put_file(&filename, &mut cursor)
            .await
            .map_err(|e| HermodError::data(msg.id(), e))?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        if let Some(stream) = self.stream.as_mut() {
            if stream.noop().await.is_ok() {
                return Ok(());
            }
            // NOOP failed: the control connection is stale. Quit and redial
            // rather than keep probing a dead socket.
            let _ = stream.quit().await;
            self.stream = None;
        }
        self.stream = Some(self.connect().await?);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit().await;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
