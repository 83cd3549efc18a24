pub mod metrics;
pub mod report;
pub mod source;
pub mod traversal;
pub mod utils;

// Re-export commonly used types
pub use metrics::TallyMetrics;
pub use source::{DataSource, ReplayFixture, ReplaySource, RowKeys, SourceError, WebDriverClient, WebDriverSource};
pub use traversal::{
    AggregationState, DateRangeFilter, DeduplicatingAggregator, FilterMode, PageReport,
    RenderStabilityDetector, TraversalController, TraversalEvent, TraversalOutcome,
    TraversalSettings, TraversalState,
};
pub use utils::Config;
