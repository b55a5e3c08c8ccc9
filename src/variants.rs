//! City-substituted prompt variants.
//!
//! Each stub template yields one generative-layout item per configured
//! condition, with the placeholder replaced by that condition's city.

use crate::config::ExperimentConfig;
use crate::dataset::{escape_field, DatasetError, DatasetLayout, Item};
use std::path::Path;

/// Expand stub templates into one item per stub and condition.
///
/// Stub ids are the 0-based line numbers of the stub text; blank lines are
/// skipped but still counted.
#[must_use]
pub fn generate_variants(stubs: &str, config: &ExperimentConfig) -> Vec<Item> {
    let mut items = Vec::new();
    for (index, stub) in stubs.lines().enumerate() {
        let stub = stub.trim();
        if stub.is_empty() {
            continue;
        }
        if !stub.contains(&config.placeholder) {
            tracing::warn!(stub = index, "Stub has no placeholder, variants will be identical");
        }
        for condition in &config.conditions {
            items.push(Item {
                stub_id: index.to_string(),
                condition: condition.letter.clone(),
                label: condition.name.clone(),
                prompt: stub.replace(&config.placeholder, &condition.city),
                candidates: Vec::new(),
            });
        }
    }
    items
}

/// Read a stub file and expand it
///
/// # Errors
///
/// Returns an error if the file is missing or unreadable.
pub fn load_variants<P: AsRef<Path>>(
    path: P,
    config: &ExperimentConfig,
) -> Result<Vec<Item>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(generate_variants(&content, config))
}

/// Render variants as generative-layout TSV
#[must_use]
pub fn format_variants(items: &[Item]) -> String {
    let mut out = String::new();
    for item in items {
        let cols: Vec<String> = item
            .fields(DatasetLayout::Generative)
            .iter()
            .map(|f| escape_field(f))
            .collect();
        out.push_str(&cols.join("\t"));
        out.push('\n');
    }
    out
}
