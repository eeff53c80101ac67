mod limits;
pub(crate) mod usage;

pub use limits::LimitSnapshotRow;
pub use usage::{
    DailyDimensionRow, DailyTotalRow, DimensionUsageRow, ModelUsageRow, ProviderUsageRow,
    ToolUsageRow, UsageScope, UsageSummary,
};
