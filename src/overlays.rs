//! Checklist Overlays
//!
//! Externally supplied adjustments applied after name resolution:
//! exceptions (explicit add/subtract of species by common name) and
//! rarity marks. These are data overlays, not part of the resolution
//! algorithm.

use anyhow::{Context, Result};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::checklist::ChecklistRow;

/// Explicit add/subtract adjustments for a count circle.
///
/// The source table has `CommonName`, `Add` and `Subtract` columns with
/// 'X' marks.
#[derive(Debug, Default)]
pub struct Exceptions {
    pub additions: HashSet<String>,
    pub subtractions: HashSet<String>,
}

impl Exceptions {
    /// Load an exceptions table; a missing file means no exceptions.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Exceptions::default());
        }

        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.into()))
            .with_context(|| format!("Failed to create CSV reader: {:?}", path))?
            .finish()
            .with_context(|| format!("Failed to load exceptions table: {:?}", path))?;

        let names = marked_column(&df, "CommonName")?;
        let add_marks = mark_flags(&df, "Add")?;
        let sub_marks = mark_flags(&df, "Subtract")?;

        let mut exceptions = Exceptions::default();
        for idx in 0..df.height() {
            if names[idx].is_empty() {
                continue;
            }
            if add_marks[idx] {
                exceptions.additions.insert(names[idx].clone());
            }
            if sub_marks[idx] {
                exceptions.subtractions.insert(names[idx].clone());
            }
        }

        tracing::info!(
            "Exceptions: {} additions, {} subtractions",
            exceptions.additions.len(),
            exceptions.subtractions.len()
        );
        Ok(exceptions)
    }

    /// Apply to a candidate name list: union the additions, then remove
    /// the subtractions.
    pub fn apply(&self, candidate_names: &[String]) -> Vec<String> {
        let mut names: Vec<String> = candidate_names.to_vec();
        for addition in &self.additions {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(addition)) {
                names.push(addition.clone());
            }
        }
        names.retain(|n| {
            !self
                .subtractions
                .iter()
                .any(|s| s.eq_ignore_ascii_case(n))
        });
        names
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.subtractions.is_empty()
    }
}

/// Load a rarities list: either a plain text file (one species per line)
/// or a CSV with `CommonName` and `Rare` columns.
pub fn load_rarities(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    if path.extension().and_then(|e| e.to_str()) == Some("txt") {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read rarities list: {:?}", path))?;
        return Ok(contents
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect());
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.into()))
        .with_context(|| format!("Failed to create CSV reader: {:?}", path))?
        .finish()
        .with_context(|| format!("Failed to load rarities table: {:?}", path))?;

    let names = marked_column(&df, "CommonName")?;
    let rare_marks = mark_flags(&df, "Rare")?;

    Ok(names
        .into_iter()
        .zip(rare_marks)
        .filter(|(name, rare)| *rare && !name.is_empty())
        .map(|(name, _)| name)
        .collect())
}

/// Mark the `rare` flag on checklist rows named in the rarities list.
pub fn mark_rarities(rows: &mut [ChecklistRow], rare_species: &[String]) {
    if rare_species.is_empty() {
        return;
    }
    for row in rows.iter_mut() {
        if rare_species
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&row.common_name))
        {
            row.rare = true;
        }
    }
}

fn marked_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let has = df.get_column_names().iter().any(|c| c.as_str() == name);
    if !has {
        return Ok(vec![String::new(); df.height()]);
    }
    let col = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?
        .cast(&DataType::String)
        .with_context(|| format!("Column '{}' not castable", name))?;
    let ca = col.str()?;
    Ok(ca
        .into_iter()
        .map(|opt| opt.unwrap_or("").trim().to_string())
        .collect())
}

/// 'X' marks in annotation tables, tolerant of case and booleans.
fn mark_flags(df: &DataFrame, name: &str) -> Result<Vec<bool>> {
    Ok(marked_column(df, name)?
        .into_iter()
        .map(|v| matches!(v.to_lowercase().as_str(), "x" | "true" | "1"))
        .collect())
}
