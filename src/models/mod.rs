use serde::{Deserialize, Serialize};

pub mod change;
pub mod deal;
pub mod listing;

// Re-exports for convenience
pub use change::*;
pub use deal::*;
pub use listing::*;

/// Fields whose change between cycles raises an `Updated` event. Other field
/// changes are absorbed into the persisted record silently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WatchedField {
    CurrentPrice,
    OriginalPrice,
    Discount,
    DealBadge,
}

impl WatchedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedField::CurrentPrice => "current_price",
            WatchedField::OriginalPrice => "original_price",
            WatchedField::Discount => "discount",
            WatchedField::DealBadge => "deal_badge",
        }
    }

    /// The watch list used when nothing else is configured
    pub fn defaults() -> Vec<WatchedField> {
        vec![WatchedField::CurrentPrice]
    }
}

impl std::fmt::Display for WatchedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
