pub mod metadata;
pub mod record;

pub use metadata::{Enrichment, EnrichmentAction, Metadata, MetadataValue, ResearchResult};
pub use record::{Category, Priority, Record, RecordFilter, RecordStatus};
