//! Hermod sink implementations (spec.md §4.6–§4.8, and the broker/document/
//! vector/HTTP sinks enumerated in §2's component table).

pub mod ftp_sink;
pub mod http_sink;
pub mod kafka_sink;
pub mod milvus_sink;
pub mod mongo_sink;
pub mod pinecone_sink;
pub mod smtp_sink;
pub mod sql_sink;
pub mod stdout_sink;

pub use ftp_sink::FtpSink;
pub use http_sink::HttpSink;
pub use kafka_sink::KafkaSink;
pub use milvus_sink::MilvusSink;
pub use mongo_sink::MongoSink;
pub use pinecone_sink::PineconeSink;
pub use smtp_sink::SmtpSink;
pub use sql_sink::SqlSink;
pub use stdout_sink::StdoutSink;

use hermod_core::config::SinkSpec;
use hermod_core::{HermodError, Sink};

/// Construct the concrete [`Sink`] a [`SinkSpec`] describes. The single
/// dispatch point `bins/hermod` (and tests that need a whole pipeline) build
/// sinks through, so adding a new sink variant only ever touches this match
/// and the config enum.
pub async fn build_sink(spec: SinkSpec) -> Result<Box<dyn Sink>, HermodError> {
    Ok(match spec {
        SinkSpec::Sql(s) => Box::new(SqlSink::connect(s).await?),
        SinkSpec::Mongo(s) => Box::new(MongoSink::connect(s).await?),
        SinkSpec::Kafka(s) => Box::new(KafkaSink::new(s)?),
        SinkSpec::Smtp(s) => Box::new(SmtpSink::connect(s).await?),
        SinkSpec::Http(s) => Box::new(HttpSink::new(s)?),
        SinkSpec::Pinecone(s) => Box::new(PineconeSink::new(s)),
        SinkSpec::Milvus(s) => Box::new(MilvusSink::new(s)),
        SinkSpec::Ftp(s) => Box::new(FtpSink::new(s)),
        SinkSpec::Stdout(s) => Box::new(StdoutSink::new(s)),
    })
}
