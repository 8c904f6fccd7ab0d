use serde::{Deserialize, Serialize};

const MAX_PAGE_SIZE: u64 = 100;

/// 1-based page request for task listings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pagination {
    pub index: u64,
    pub size: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { index: 1, size: 10 }
    }
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        self.index.saturating_sub(1).saturating_mul(self.size)
    }

    pub fn limit(&self) -> u64 {
        self.size
    }

    /// Falls back to the first page for zero values and caps the page size.
    pub fn check(&self) -> Self {
        if self.index < 1 || self.size < 1 {
            return Self::default();
        }
        Self {
            index: self.index,
            size: self.size.min(MAX_PAGE_SIZE),
        }
    }
}
