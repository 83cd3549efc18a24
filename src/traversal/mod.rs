pub mod aggregator;
pub mod controller;
pub mod filter;
pub mod poll;
pub mod signature;
pub mod stability;
pub mod transition;

pub use aggregator::{AggregationState, DeduplicatingAggregator, PageReport, BLANK_CATEGORY};
pub use controller::{
    ColumnLabels, TraversalController, TraversalEvent, TraversalOutcome, TraversalSettings,
    TraversalState,
};
pub use filter::{Clock, DateRangeFilter, FilterMode, Period, PeriodUnit, Verdict, Window};
pub use poll::PollSettings;
pub use signature::{row_signature, PageSnapshot};
pub use stability::{FillStats, RenderStabilityDetector, StabilitySettings};
pub use transition::{PageMarker, PageTransitionDetector, TransitionEvidence};
