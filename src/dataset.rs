//! Tab-separated dataset and result files.
//!
//! Input rows are read against an explicit [`DatasetLayout`] instead of fixed
//! column positions. Result rows carry the item, the pooled distribution as
//! alternating label/probability pairs sorted by label, then the generated
//! texts.

use crate::distribution::Distribution;
use crate::scoring::{ConditionGroup, ScoringError};
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while reading or writing datasets
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset file not found: {0}")]
    NotFound(String),

    #[error("Dataset contains no rows")]
    Empty,

    #[error("Line {line}: expected at least {expected} columns, found {found}")]
    ShortRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Line {line}: label/probability columns are not paired")]
    UnpairedColumns { line: usize },

    #[error("Line {line}: invalid probability {value:?}")]
    InvalidProbability { line: usize, value: String },

    #[error("Line {line}: distribution sums to {mass}, not 1 (wrong text-column count?)")]
    Unnormalized { line: usize, mass: f64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Column schema of an input dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLayout {
    /// `stub, condition, prompt, label`; the option set comes from the model
    Generative,
    /// `stub, condition, label, prompt, candidate...`
    Masked,
}

impl DatasetLayout {
    /// Number of fixed leading columns
    #[must_use]
    pub const fn fixed_columns(self) -> usize {
        4
    }
}

/// One prompt of the experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Identifier shared by every condition rendered from the same stub
    pub stub_id: String,
    /// Condition letter
    pub condition: String,
    /// Condition label (e.g. country name)
    pub label: String,
    /// Prompt text sent to the model
    pub prompt: String,
    /// Explicit fill candidates (masked layout only)
    pub candidates: Vec<String>,
}

impl Item {
    /// Parse one row under the given layout
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::ShortRow`] if fixed columns are missing.
    pub fn parse(line_no: usize, line: &str, layout: DatasetLayout) -> Result<Self, DatasetError> {
        let cols: Vec<String> = line.split('\t').map(unescape_field).collect();
        let fixed = layout.fixed_columns();
        if cols.len() < fixed {
            return Err(DatasetError::ShortRow {
                line: line_no,
                expected: fixed,
                found: cols.len(),
            });
        }

        let mut cols = cols.into_iter();
        let stub_id = cols.next().unwrap_or_default();
        let condition = cols.next().unwrap_or_default();
        let third = cols.next().unwrap_or_default();
        let fourth = cols.next().unwrap_or_default();

        Ok(match layout {
            DatasetLayout::Generative => Self {
                stub_id,
                condition,
                label: fourth,
                prompt: third,
                candidates: Vec::new(),
            },
            DatasetLayout::Masked => Self {
                stub_id,
                condition,
                label: third,
                prompt: fourth,
                candidates: cols.filter(|c| !c.trim().is_empty()).collect(),
            },
        })
    }

    /// Fixed columns in the layout's order
    #[must_use]
    pub fn fields(&self, layout: DatasetLayout) -> [&str; 4] {
        match layout {
            DatasetLayout::Generative => [
                self.stub_id.as_str(),
                self.condition.as_str(),
                self.prompt.as_str(),
                self.label.as_str(),
            ],
            DatasetLayout::Masked => [
                self.stub_id.as_str(),
                self.condition.as_str(),
                self.label.as_str(),
                self.prompt.as_str(),
            ],
        }
    }
}

/// Parse every non-blank row of a dataset
///
/// # Errors
///
/// Returns an error on the first malformed row or if no rows are present.
pub fn parse_items(content: &str, layout: DatasetLayout) -> Result<Vec<Item>, DatasetError> {
    let items = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| Item::parse(i + 1, line.trim_end_matches('\r'), layout))
        .collect::<Result<Vec<_>, _>>()?;

    if items.is_empty() {
        return Err(DatasetError::Empty);
    }
    Ok(items)
}

/// Load a dataset file
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable, or malformed.
pub fn load_items<P: AsRef<Path>>(path: P, layout: DatasetLayout) -> Result<Vec<Item>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    parse_items(&std::fs::read_to_string(path)?, layout)
}

/// Output path for a dataset: `<dir>/<stem>_results.tsv`
#[must_use]
pub fn results_path(input: &Path) -> PathBuf {
    let stem = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = stem.split('.').next().unwrap_or_default();
    input.with_file_name(format!("{stem}_results.tsv"))
}

/// Pooled query result for one generative item
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub item: Item,
    pub distribution: Distribution,
    /// Generated text of every sample
    pub texts: Vec<String>,
}

impl ResultRow {
    /// Render as one TSV line (without trailing newline)
    #[must_use]
    pub fn to_tsv_line(&self) -> String {
        let mut cols: Vec<String> = self
            .item
            .fields(DatasetLayout::Generative)
            .iter()
            .map(|f| escape_field(f))
            .collect();
        for (label, prob) in self.distribution.iter() {
            cols.push(escape_field(label));
            cols.push(prob.to_string());
        }
        cols.extend(self.texts.iter().map(|t| escape_field(t)));
        cols.join("\t")
    }

    /// Parse a result line whose last `text_columns` columns are generated texts
    ///
    /// # Errors
    ///
    /// Returns an error if columns are missing, unpaired, not numeric, or if
    /// the probabilities do not sum to 1.
    pub fn parse(line_no: usize, line: &str, text_columns: usize) -> Result<Self, DatasetError> {
        let cols: Vec<&str> = line.split('\t').collect();
        let fixed = DatasetLayout::Generative.fixed_columns();
        if cols.len() < fixed + text_columns {
            return Err(DatasetError::ShortRow {
                line: line_no,
                expected: fixed + text_columns,
                found: cols.len(),
            });
        }

        let item = Item::parse(line_no, &cols[..fixed].join("\t"), DatasetLayout::Generative)?;
        let split = cols.len() - text_columns;
        let pairs = &cols[fixed..split];
        if pairs.len() % 2 != 0 {
            return Err(DatasetError::UnpairedColumns { line: line_no });
        }

        let mut distribution = Distribution::new();
        for pair in pairs.chunks_exact(2) {
            let prob: f64 = pair[1]
                .trim()
                .parse()
                .map_err(|_| DatasetError::InvalidProbability {
                    line: line_no,
                    value: pair[1].to_string(),
                })?;
            distribution.accumulate(unescape_field(pair[0]), prob);
        }
        if !distribution.is_normalized() {
            return Err(DatasetError::Unnormalized {
                line: line_no,
                mass: distribution.total_mass(),
            });
        }

        Ok(Self {
            item,
            distribution,
            texts: cols[split..].iter().map(|t| unescape_field(t)).collect(),
        })
    }
}

/// Render result rows as a TSV document
#[must_use]
pub fn format_results(rows: &[ResultRow]) -> String {
    let mut out = String::new();
    for row in rows {
        writeln!(out, "{}", row.to_tsv_line()).ok();
    }
    out
}

/// Write result rows to a TSV file
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_results<P: AsRef<Path>>(path: P, rows: &[ResultRow]) -> Result<(), DatasetError> {
    std::fs::write(path, format_results(rows))?;
    Ok(())
}

/// Parse a results document
///
/// # Errors
///
/// Returns an error on the first malformed row or if no rows are present.
pub fn parse_results(content: &str, text_columns: usize) -> Result<Vec<ResultRow>, DatasetError> {
    let rows = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| ResultRow::parse(i + 1, line.trim_end_matches('\r'), text_columns))
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Err(DatasetError::Empty);
    }
    Ok(rows)
}

/// Read a results file
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable, or malformed.
pub fn read_results<P: AsRef<Path>>(
    path: P,
    text_columns: usize,
) -> Result<Vec<ResultRow>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    parse_results(&std::fs::read_to_string(path)?, text_columns)
}

/// Group result rows by stub, in order of first appearance
///
/// # Errors
///
/// Fails if a stub has no reference row or repeats a condition.
pub fn condition_groups(
    rows: &[ResultRow],
    reference: &str,
) -> Result<Vec<ConditionGroup>, ScoringError> {
    let mut order: Vec<&str> = Vec::new();
    let mut members: HashMap<&str, Vec<(String, Distribution)>> = HashMap::new();

    for row in rows {
        let stub = row.item.stub_id.as_str();
        members
            .entry(stub)
            .or_insert_with(|| {
                order.push(stub);
                Vec::new()
            })
            .push((row.item.condition.clone(), row.distribution.clone()));
    }

    order
        .into_iter()
        .map(|stub| {
            let stub_members = members.remove(stub).unwrap_or_default();
            ConditionGroup::from_members(stub, reference, stub_members)
        })
        .collect()
}

/// Escape tabs, newlines and backslashes so a value fits one TSV cell
#[must_use]
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_field`]; unknown escapes are kept verbatim
#[must_use]
pub fn unescape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
