//! Hermod source implementations (spec.md §4.3, §4.4, and the broker/file
//! sources enumerated in §2's component table).

pub mod csv_source;
pub mod kafka_source;
pub mod postgres_cdc;
pub mod row_polling;
pub mod webhook_source;

pub use csv_source::CsvSource;
pub use kafka_source::KafkaSource;
pub use postgres_cdc::PostgresCdcSource;
pub use row_polling::{RowPollingSource, RowStore, SqlxRowStore};
pub use webhook_source::WebhookSource;

use hermod_core::config::SourceSpec;
use hermod_core::{HermodError, Source};

/// Construct the concrete [`Source`] a [`SourceSpec`] describes — the
/// dispatch point `bins/hermod` builds its single configured source
/// through, mirroring `hermod_sinks::build_sink`.
pub async fn build_source(spec: SourceSpec) -> Result<Box<dyn Source>, HermodError> {
    Ok(match spec {
        SourceSpec::PostgresCdc(s) => Box::new(PostgresCdcSource::new(s)),
        SourceSpec::RowPolling(s) => {
            let store = SqlxRowStore::connect(s.kind, &s.dsn).await?;
            Box::new(RowPollingSource::new(store, s.tables, s.id_field, s.poll_interval))
        }
        SourceSpec::Csv(s) => Box::new(CsvSource::try_new(s)?),
        SourceSpec::Kafka(s) => Box::new(KafkaSource::new(s)),
        SourceSpec::Webhook(s) => Box::new(WebhookSource::new(s)),
    })
}
