//! Selection criteria for claiming a task.

use crate::error::{Result, RowqError};
use crate::task::TaskStatus;

/// Which tasks a pop may claim.
///
/// Stores turn this into a `WHERE` clause. Statuses and type names are bound
/// as parameters; `raw_predicate` is pushed verbatim and must come from
/// trusted configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopFilter {
    /// Acceptable source statuses.
    pub statuses: Vec<TaskStatus>,
    /// Only claim these task kinds (empty: any kind).
    pub include_types: Vec<String>,
    /// Never claim these task kinds.
    pub exclude_types: Vec<String>,
    /// Extra boolean SQL expression against the tasks table.
    pub raw_predicate: Option<String>,
    /// Skip rows locked by a concurrent claim instead of waiting on them.
    pub skip_locked: bool,
}

impl Default for PopFilter {
    fn default() -> Self {
        Self {
            statuses: vec![TaskStatus::New],
            include_types: Vec::new(),
            exclude_types: Vec::new(),
            raw_predicate: None,
            skip_locked: false,
        }
    }
}

impl PopFilter {
    /// Filter accepting `New` tasks of any kind.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the acceptable source statuses.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Restrict to the given task kinds.
    pub fn include_types<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.include_types = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude the given task kinds.
    pub fn exclude_types<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.exclude_types = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Add a raw SQL predicate.
    pub fn raw_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.raw_predicate = Some(predicate.into());
        self
    }

    /// Use `SKIP LOCKED` where the store supports it.
    pub fn skip_locked(mut self, skip: bool) -> Self {
        self.skip_locked = skip;
        self
    }

    /// Reject filters that cannot match anything or would produce invalid SQL.
    pub fn validate(&self) -> Result<()> {
        if self.statuses.is_empty() {
            return Err(RowqError::Config(
                "pop filter needs at least one source status".to_string(),
            ));
        }
        if let Some(predicate) = &self.raw_predicate {
            if predicate.trim().is_empty() {
                return Err(RowqError::Config("raw filter predicate is empty".to_string()));
            }
        }
        Ok(())
    }

    /// Status values as stored in the `status` column.
    pub fn status_values(&self) -> Vec<&'static str> {
        self.statuses.iter().map(TaskStatus::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let filter = PopFilter::default();
        assert_eq!(filter.statuses, vec![TaskStatus::New]);
        assert!(filter.include_types.is_empty());
        assert!(filter.exclude_types.is_empty());
        assert!(filter.raw_predicate.is_none());
        assert!(!filter.skip_locked);
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let filter = PopFilter::new()
            .statuses([TaskStatus::New, TaskStatus::Failed])
            .include_types(["bad"])
            .exclude_types(vec!["slow".to_string()])
            .raw_predicate("priority > 10")
            .skip_locked(true);

        assert_eq!(filter.status_values(), vec!["new", "failed"]);
        assert_eq!(filter.include_types, vec!["bad"]);
        assert_eq!(filter.exclude_types, vec!["slow"]);
        assert_eq!(filter.raw_predicate.as_deref(), Some("priority > 10"));
        assert!(filter.skip_locked);
    }

    #[test]
    fn test_empty_statuses_rejected() {
        let filter = PopFilter::new().statuses([]);
        assert!(matches!(filter.validate(), Err(RowqError::Config(_))));
    }

    #[test]
    fn test_blank_raw_predicate_rejected() {
        let filter = PopFilter::new().raw_predicate("   ");
        assert!(matches!(filter.validate(), Err(RowqError::Config(_))));
    }
}
