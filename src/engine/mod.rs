// FILE: src/engine/mod.rs
pub mod aggregate;
pub mod enrich;
pub mod indexer;
pub mod lookup;
pub mod pool;

pub use aggregate::{SizeOutcome, Sizer};
pub use enrich::{EnrichReport, EnrichTarget, Enricher, Enrichment};
pub use indexer::{Convergence, ConvergenceReport, Indexer, PassStats};
pub use lookup::{Disabled, Lookup, MetadataSource, MovieMeta, TitleSearch};
pub use pool::{BackgroundQueue, TaskOutcome, WorkerPool};
