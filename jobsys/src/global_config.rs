// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::job_engine::category::Category;

/// Frame budget used by [`DrainPolicy::Budgeted`] when none is configured.
pub const DEFAULT_FRAME_BUDGET_MS: u64 = 4;

/// How `begin_frame` drains the main category.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
    #[default]
    /// Run every ready main-thread job, including ones queued while draining
    All,
    /// Stop once the frame budget is used up; the rest waits for the next frame
    Budgeted,
}

/// Scheduler settings. Every field has a default, so a JSON file only needs
/// to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Background worker threads, spread round-robin over the background
    /// categories. Defaults to one less than the available cores, but never
    /// fewer than the number of background categories.
    pub worker_count: usize,
    pub category_count: usize,
    /// Category drained by `begin_frame` instead of by workers.
    pub main_category: Option<Category>,
    pub drain: DrainPolicy,
    pub frame_budget_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get().saturating_sub(1))
            .unwrap_or(3);
        // one worker per background category at least, or their jobs never run
        let background = Category::DEFAULT_COUNT - 1;
        Self {
            worker_count: workers.max(background),
            category_count: Category::DEFAULT_COUNT,
            main_category: Some(Category::MAIN),
            drain: DrainPolicy::All,
            frame_budget_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_categories(mut self, category_count: usize, main: Option<Category>) -> Self {
        self.category_count = category_count;
        self.main_category = main;
        self
    }

    pub fn with_frame_budget(mut self, budget: Duration) -> Self {
        self.drain = DrainPolicy::Budgeted;
        self.frame_budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, SchedulerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.category_count == 0 || self.category_count > Category::MAX_COUNT {
            return Err(SchedulerError::InvalidCategoryCount {
                count: self.category_count,
                max: Category::MAX_COUNT,
            });
        }
        if let Some(main) = self.main_category {
            if main.index() >= self.category_count {
                return Err(SchedulerError::InvalidMainCategory {
                    main,
                    count: self.category_count,
                });
            }
        }
        Ok(())
    }

    /// Budget applied by `begin_frame`; `None` drains everything.
    pub fn frame_budget(&self) -> Option<Duration> {
        match self.drain {
            DrainPolicy::All => None,
            DrainPolicy::Budgeted => Some(Duration::from_millis(
                self.frame_budget_ms.unwrap_or(DEFAULT_FRAME_BUDGET_MS),
            )),
        }
    }

    /// Categories served by worker threads, in index order.
    pub fn background_categories(&self) -> Vec<Category> {
        (0..self.category_count.min(Category::MAX_COUNT))
            .map(|i| Category(i as u8))
            .filter(|c| Some(*c) != self.main_category)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count >= config.background_categories().len());
        assert_eq!(config.frame_budget(), None);
        assert_eq!(
            config.background_categories(),
            vec![
                Category::GENERIC,
                Category::LOGGING,
                Category::IO,
                Category::RENDER
            ]
        );
    }

    #[test]
    fn test_partial_json() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "worker_count": 2, "drain": "budgeted", "frame_budget_ms": 8 }"#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.category_count, Category::DEFAULT_COUNT);
        assert_eq!(config.frame_budget(), Some(Duration::from_millis(8)));
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(matches!(
            SchedulerConfig::from_json_str(r#"{ "category_count": 0 }"#),
            Err(SchedulerError::InvalidCategoryCount { .. })
        ));
        assert!(matches!(
            SchedulerConfig::from_json_str(r#"{ "category_count": 3, "main_category": 4 }"#),
            Err(SchedulerError::InvalidMainCategory { .. })
        ));
        assert!(matches!(
            SchedulerConfig::from_json_str(r#"{ "workers": 3 }"#),
            Err(SchedulerError::Config(_))
        ));
    }

    #[test]
    fn test_no_main_category() {
        let config = SchedulerConfig::default().with_categories(2, None);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.background_categories(),
            vec![Category(0), Category(1)]
        );
    }
}
