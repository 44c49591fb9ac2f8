//! Defect catalog

use serde::{Deserialize, Serialize};

/// Result still being classified
pub const CLASSIFYING: i32 = 0;
/// Target passed
pub const GOOD: i32 = 1;

const FIRST_DEFECT: i32 = 2;

/// Names for classification codes
///
/// Code 0 is "Classifying", 1 is "Good", and category `i` of the list maps
/// to code `i + 2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectCatalog {
    categories: Vec<String>,
}

impl Default for DefectCatalog {
    fn default() -> Self {
        Self::new(vec![
            "Dark".to_string(),
            "Bright".to_string(),
            "Stain".to_string(),
        ])
    }
}

impl DefectCatalog {
    pub fn new(categories: Vec<String>) -> Self {
        Self { categories }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Name of a code, `None` when outside the catalog
    pub fn name(&self, code: i32) -> Option<&str> {
        match code {
            CLASSIFYING => Some("Classifying"),
            GOOD => Some("Good"),
            c if c >= FIRST_DEFECT => self
                .categories
                .get((c - FIRST_DEFECT) as usize)
                .map(String::as_str),
            _ => None,
        }
    }

    /// Code of a category name
    pub fn code(&self, name: &str) -> Option<i32> {
        match name {
            "Classifying" => Some(CLASSIFYING),
            "Good" => Some(GOOD),
            _ => self
                .categories
                .iter()
                .position(|c| c == name)
                .map(|i| i as i32 + FIRST_DEFECT),
        }
    }

    /// Whether `code` names a defect category
    pub fn is_defect(&self, code: i32) -> bool {
        code >= FIRST_DEFECT && ((code - FIRST_DEFECT) as usize) < self.categories.len()
    }

    /// Names of the defect codes in `codes`, Good and unknown codes skipped
    pub fn defect_names(&self, codes: &[i32]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for &code in codes {
            if !self.is_defect(code) {
                continue;
            }
            if let Some(name) = self.name(code) {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}
