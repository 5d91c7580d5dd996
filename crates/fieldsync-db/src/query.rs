//! Range queries over primary keys.
//!
//! Keys are strings and compare bytewise, which matches SQLite's default
//! `BINARY` collation and `String`'s `Ord`, so both engines agree on order.

/// Inclusive key bounds. `None` leaves that side open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        KeyRange::default()
    }

    /// `lower <= key <= upper`.
    pub fn bound(lower: impl Into<String>, upper: impl Into<String>) -> Self {
        KeyRange {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }

    /// `key >= lower`.
    pub fn lower_bound(lower: impl Into<String>) -> Self {
        KeyRange {
            lower: Some(lower.into()),
            upper: None,
        }
    }

    /// `key <= upper`.
    pub fn upper_bound(upper: impl Into<String>) -> Self {
        KeyRange {
            lower: None,
            upper: Some(upper.into()),
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let lower = prefix.into();
        let mut upper = lower.clone();
        upper.push(char::MAX);
        KeyRange {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lower.as_deref().map_or(true, |l| key >= l)
            && self.upper.as_deref().map_or(true, |u| key <= u)
    }
}

/// Options for `get_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub range: KeyRange,
    pub limit: Option<usize>,
}

impl Query {
    pub fn range(range: KeyRange) -> Self {
        Query { range, limit: None }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
