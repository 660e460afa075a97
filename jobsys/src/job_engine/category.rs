// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

/// A lane of work. Every category owns exactly one queue.
///
/// The set of categories is fixed when the scheduler is built; the
/// constants below name the lanes of the default layout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub u8);

impl Category {
    pub const GENERIC: Category = Category(0);
    pub const LOGGING: Category = Category(1);
    pub const IO: Category = Category(2);
    pub const RENDER: Category = Category(3);
    /// Drained manually on the owning thread, never by a worker.
    pub const MAIN: Category = Category(4);

    /// Number of categories in the default layout.
    pub const DEFAULT_COUNT: usize = 5;

    /// Upper bound for `category_count`.
    pub const MAX_COUNT: usize = 64;

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GENERIC => "generic",
            Self::LOGGING => "logging",
            Self::IO => "io",
            Self::RENDER => "render",
            Self::MAIN => "main",
            _ => "custom",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            "custom" => write!(f, "category-{}", self.0),
            name => f.write_str(name),
        }
    }
}

impl From<u8> for Category {
    fn from(value: u8) -> Self {
        Category(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(Category::IO.to_string(), "io");
        assert_eq!(Category::MAIN.to_string(), "main");
        assert_eq!(Category(9).to_string(), "category-9");
    }
}
