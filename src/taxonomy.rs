//! Reference Taxonomy
//!
//! Authoritative name-to-entity resolution. The base list is the
//! eBird/Clements taxonomy (it matches names reported through eBird, has
//! the taxon_order field for sorting, and contains hybrid and spuh
//! entries); IOC and NACC cross-reference lists are merged in with left
//! joins keyed on common name, so the primary list stays authoritative for
//! which entities exist.
//!
//! Only species carry an official NACC sort order. Sort orders for issf,
//! slash, spuh and the other categories are synthesized per family from
//! plausible parent species and smeared with small fractional offsets so
//! same-base siblings keep a strict order.

use anyhow::{Context, Result};
use polars::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache;

/// Sort value for records missing a taxon order; sorts them first.
pub const MISSING_TAXON_ORDER: i64 = 0;

/// Taxonomic category of a reference row.
///
/// Listed in preference order: species first, spuh last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Species,
    Issf,
    Slash,
    Spuh,
    Hybrid,
    Form,
    Intergrade,
    Domestic,
}

impl Category {
    /// All categories in match-preference order.
    pub const PREFERENCE_ORDER: [Category; 8] = [
        Category::Species,
        Category::Issf,
        Category::Slash,
        Category::Spuh,
        Category::Hybrid,
        Category::Form,
        Category::Intergrade,
        Category::Domestic,
    ];

    /// Case-insensitive parse of the category column.
    pub fn parse(value: &str) -> Option<Category> {
        match value.trim().to_lowercase().as_str() {
            "species" => Some(Category::Species),
            "issf" => Some(Category::Issf),
            "slash" => Some(Category::Slash),
            "spuh" => Some(Category::Spuh),
            "hybrid" => Some(Category::Hybrid),
            "form" => Some(Category::Form),
            "intergrade" => Some(Category::Intergrade),
            "domestic" => Some(Category::Domestic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Species => "species",
            Category::Issf => "issf",
            Category::Slash => "slash",
            Category::Spuh => "spuh",
            Category::Hybrid => "hybrid",
            Category::Form => "form",
            Category::Intergrade => "intergrade",
            Category::Domestic => "domestic",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reference taxonomy row.
///
/// Banding and common-name code sets are pipe-delimited in the source
/// files (e.g. "TUSW|TUNS") and parsed into vectors at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonEntity {
    pub com_name: String,
    pub sci_name: String,
    pub species_code: String,
    pub category: Category,
    pub taxon_order: i64,
    pub order: String,
    pub family_com_name: String,
    pub family_sci_name: String,
    /// Species code of the base species this entity rolls up under.
    pub report_as: Option<String>,
    pub banding_codes: Vec<String>,
    pub com_name_codes: Vec<String>,
    pub ioc_sort_order: i64,
    pub nacc_sort_order: f64,
}

/// Paths to the reference lists merged into the taxonomy.
#[derive(Debug, Clone)]
pub struct TaxonomySources {
    /// Primary eBird/Clements CSV; authoritative for which entities exist.
    pub primary: PathBuf,
    /// IOC comparison list (provides `ioc_seq`), joined on
    /// `ioc_clements_common_name`.
    pub ioc: Option<PathBuf>,
    /// NACC list (provides `NACC_SORT_ORDER`), joined on
    /// `nacc_common_name`.
    pub nacc: Option<PathBuf>,
}

/// The only fatal condition in the core: the authoritative name list is
/// missing or unusable at construction time.
#[derive(Debug, Error)]
pub enum TaxonomyLoadError {
    #[error("failed to read taxonomy file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("taxonomy file {path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },
    #[error("taxonomy contains no entities")]
    Empty,
}

/// Combined taxonomy with case-insensitive name indexes.
///
/// Read-only after construction; safe to share across parallel workers.
pub struct Taxonomy {
    entities: Vec<TaxonEntity>,
    common_index: FxHashMap<String, usize>,
    scientific_index: FxHashMap<String, usize>,
    code_index: FxHashMap<String, usize>,
    cache_key: Option<String>,
}

impl Taxonomy {
    /// Load the merged taxonomy, using the disk cache when `cache_dir` is
    /// given and the source files are unchanged.
    pub fn load(sources: &TaxonomySources, cache_dir: Option<&Path>) -> Result<Self> {
        let (entities, cache_key) = match cache_dir {
            Some(dir) => {
                let mut hashed: Vec<&Path> = vec![sources.primary.as_path()];
                if let Some(ioc) = &sources.ioc {
                    hashed.push(ioc.as_path());
                }
                if let Some(nacc) = &sources.nacc {
                    hashed.push(nacc.as_path());
                }
                let key = cache::content_hash(&hashed)?;
                let cache_path = dir.join(format!("taxonomy_full-{}.json", &key[..16]));
                let entities = cache::load_or_build(&cache_path, || build_entities(sources))?;
                (entities, Some(key))
            }
            None => (build_entities(sources)?, None),
        };

        let mut taxonomy = Taxonomy::from_entities(entities)?;
        taxonomy.cache_key = cache_key;
        Ok(taxonomy)
    }

    /// Build a taxonomy from already-materialized entities.
    ///
    /// The caller is responsible for sort-order synthesis; `load` runs it
    /// before caching.
    pub fn from_entities(entities: Vec<TaxonEntity>) -> Result<Self, TaxonomyLoadError> {
        if entities.is_empty() {
            return Err(TaxonomyLoadError::Empty);
        }

        let mut common_index = FxHashMap::default();
        let mut scientific_index = FxHashMap::default();
        let mut code_index = FxHashMap::default();

        for (idx, entity) in entities.iter().enumerate() {
            let common_key = entity.com_name.to_lowercase();
            if !common_key.is_empty() {
                if common_index.contains_key(&common_key) {
                    // Uniqueness is a data invariant; first match wins
                    tracing::warn!("duplicate common name in taxonomy: {}", entity.com_name);
                } else {
                    common_index.insert(common_key, idx);
                }
            }

            let sci_key = entity.sci_name.to_lowercase();
            if !sci_key.is_empty() {
                scientific_index.entry(sci_key).or_insert(idx);
            }

            let code_key = entity.species_code.to_lowercase();
            if !code_key.is_empty() {
                code_index.entry(code_key).or_insert(idx);
            }
        }

        Ok(Taxonomy {
            entities,
            common_index,
            scientific_index,
            code_index,
            cache_key: None,
        })
    }

    /// Case-insensitive exact match on common name.
    pub fn find_by_common_name(&self, name: &str) -> Option<&TaxonEntity> {
        if name.is_empty() {
            return None;
        }
        self.common_index
            .get(&name.to_lowercase())
            .map(|&idx| &self.entities[idx])
    }

    /// Case-insensitive exact match on scientific name.
    pub fn find_by_scientific_name(&self, name: &str) -> Option<&TaxonEntity> {
        if name.is_empty() {
            return None;
        }
        self.scientific_index
            .get(&name.to_lowercase())
            .map(|&idx| &self.entities[idx])
    }

    /// Follow `report_as` to the entity's base species.
    pub fn resolve_parent(&self, entity: &TaxonEntity) -> Option<&TaxonEntity> {
        let code = entity.report_as.as_deref()?;
        if code.is_empty() {
            return None;
        }
        self.code_index
            .get(&code.to_lowercase())
            .map(|&idx| &self.entities[idx])
    }

    /// Common name of the base species a named entity rolls up under.
    pub fn report_as(&self, common_name: &str) -> Option<&str> {
        let entity = self.find_by_common_name(common_name)?;
        self.resolve_parent(entity).map(|e| e.com_name.as_str())
    }

    /// Common name for a short species code, e.g. "buffle" -> "Bufflehead".
    pub fn species_code_to_common_name(&self, code: &str) -> Option<&str> {
        if code.is_empty() {
            return None;
        }
        self.code_index
            .get(&code.to_lowercase())
            .map(|&idx| self.entities[idx].com_name.as_str())
    }

    /// Species code for a common name; None on miss, never panics.
    pub fn common_name_to_species_code(&self, common_name: &str) -> Option<&str> {
        self.find_by_common_name(common_name)
            .map(|e| e.species_code.as_str())
            .filter(|code| !code.is_empty())
    }

    /// Subset of `common_names` whose taxonomy category is issf.
    pub fn filter_issf(&self, common_names: &[String]) -> Vec<String> {
        common_names
            .iter()
            .filter(|cn| {
                self.find_by_common_name(cn)
                    .map_or(false, |e| e.category == Category::Issf)
            })
            .cloned()
            .collect()
    }

    /// Subset of `common_names` whose taxonomy category is species.
    pub fn filter_species(&self, common_names: &[String]) -> Vec<String> {
        common_names
            .iter()
            .filter(|cn| {
                self.find_by_common_name(cn)
                    .map_or(false, |e| e.category == Category::Species)
            })
            .cloned()
            .collect()
    }

    pub fn entities(&self) -> &[TaxonEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Content hash of the source files, when loaded through the cache.
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }
}

// -------------------------- Loading and merging --------------------------

fn read_reference_csv(path: &Path) -> Result<DataFrame, TaxonomyLoadError> {
    CsvReadOptions::default()
        .with_has_header(true)
        // Read everything as strings; numeric fields are parsed explicitly
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.into()))
        .and_then(|reader| reader.finish())
        .map_err(|err| TaxonomyLoadError::Unreadable {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Materialize a column as strings, empty string for nulls. Returns a
/// column of empty strings when the column is absent.
fn column_strings(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    if !has_column(df, name) {
        return Ok(vec![String::new(); df.height()]);
    }
    let col = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?
        .cast(&DataType::String)
        .with_context(|| format!("Column '{}' not castable to string", name))?;
    let ca = col.str().with_context(|| format!("Column '{}' is not string type", name))?;
    Ok(ca
        .into_iter()
        .map(|opt| opt.unwrap_or("").trim().to_string())
        .collect())
}

fn parse_codes(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Cross-reference list as a lookup table: lowercase common name -> value
/// column. Unmatched rows are simply never looked up, which gives the
/// left-join semantics the merge needs (the primary list stays
/// authoritative for which entities exist).
fn read_cross_reference(
    path: &Path,
    key_col: &str,
    value_col: &str,
) -> Result<FxHashMap<String, String>> {
    let df = read_reference_csv(path)?;
    if !has_column(&df, key_col) {
        return Err(TaxonomyLoadError::MissingColumn {
            path: path.to_path_buf(),
            column: key_col.to_string(),
        }
        .into());
    }

    let keys = column_strings(&df, key_col)?;
    let values = column_strings(&df, value_col)?;

    let mut map = FxHashMap::default();
    for (key, value) in keys.into_iter().zip(values) {
        if !key.is_empty() && !value.is_empty() {
            map.entry(key.to_lowercase()).or_insert(value);
        }
    }
    Ok(map)
}

/// Merge the primary list with the cross-reference lists and synthesize
/// sort orders for non-species rows.
fn build_entities(sources: &TaxonomySources) -> Result<Vec<TaxonEntity>> {
    tracing::info!("Creating full taxonomy from {:?}", sources.primary);
    let primary = read_reference_csv(&sources.primary)?;

    for required in ["comName", "sciName", "category", "taxonOrder"] {
        if !has_column(&primary, required) {
            return Err(TaxonomyLoadError::MissingColumn {
                path: sources.primary.clone(),
                column: required.to_string(),
            }
            .into());
        }
    }

    let ioc_seqs = match &sources.ioc {
        Some(path) => read_cross_reference(path, "ioc_clements_common_name", "ioc_seq")?,
        None => FxHashMap::default(),
    };
    let nacc_orders = match &sources.nacc {
        Some(path) => read_cross_reference(path, "nacc_common_name", "NACC_SORT_ORDER")?,
        None => FxHashMap::default(),
    };

    let df = primary;
    let com_names = column_strings(&df, "comName")?;
    let sci_names = column_strings(&df, "sciName")?;
    let species_codes = column_strings(&df, "speciesCode")?;
    let categories = column_strings(&df, "category")?;
    let taxon_orders = column_strings(&df, "taxonOrder")?;
    let orders = column_strings(&df, "order")?;
    let family_com_names = column_strings(&df, "familyComName")?;
    let family_sci_names = column_strings(&df, "familySciName")?;
    let report_as = column_strings(&df, "reportAs")?;
    let banding_codes = column_strings(&df, "bandingCodes")?;
    let com_name_codes = column_strings(&df, "comNameCodes")?;

    let mut entities = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        if com_names[idx].is_empty() {
            continue;
        }
        let category = match Category::parse(&categories[idx]) {
            Some(cat) => cat,
            None => {
                tracing::warn!(
                    "unknown category '{}' for '{}', row skipped",
                    categories[idx],
                    com_names[idx]
                );
                continue;
            }
        };

        let key = com_names[idx].to_lowercase();
        entities.push(TaxonEntity {
            com_name: com_names[idx].clone(),
            sci_name: sci_names[idx].clone(),
            species_code: species_codes[idx].clone(),
            category,
            taxon_order: taxon_orders[idx]
                .parse::<f64>()
                .map(|v| v as i64)
                .unwrap_or(MISSING_TAXON_ORDER),
            order: orders[idx].clone(),
            family_com_name: family_com_names[idx].clone(),
            family_sci_name: family_sci_names[idx].clone(),
            report_as: if report_as[idx].is_empty() {
                None
            } else {
                Some(report_as[idx].clone())
            },
            banding_codes: parse_codes(&banding_codes[idx]),
            com_name_codes: parse_codes(&com_name_codes[idx]),
            ioc_sort_order: ioc_seqs
                .get(&key)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as i64)
                .unwrap_or(0),
            nacc_sort_order: nacc_orders
                .get(&key)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
        });
    }

    tracing::info!("Merged taxonomy: {} records", entities.len());

    synthesize_sort_orders(&mut entities);

    Ok(entities)
}

// -------------------------- Sort-order synthesis --------------------------

fn codes_overlap(left: &[String], right: &[String]) -> bool {
    left.iter().any(|code| right.contains(code))
}

/// Synthesize NACC sort orders for non-species rows.
///
/// Per (order, family) group: a spuh takes the family maximum; any other
/// non-species row takes the maximum over parent species whose banding
/// codes (or, failing that, common-name codes) overlap the row's
/// common-name codes, falling back to the family maximum when nothing
/// overlaps. Rows that landed on the same base value are then smeared
/// (base + 0.1, base + 0.2, ... or hundredths for ten or more siblings) to
/// keep a strict order.
pub fn synthesize_sort_orders(entities: &mut [TaxonEntity]) {
    let mut families: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (idx, entity) in entities.iter().enumerate() {
        families
            .entry((entity.order.clone(), entity.family_com_name.clone()))
            .or_default()
            .push(idx);
    }

    // (entity index, base sort order), in taxonomy order
    let mut pending: Vec<(usize, f64)> = Vec::new();

    for member_idxs in families.values() {
        let family_max = member_idxs
            .iter()
            .map(|&i| entities[i].nacc_sort_order)
            .fold(0.0_f64, f64::max);
        if family_max <= 0.0 {
            continue;
        }

        let species_idxs: Vec<usize> = member_idxs
            .iter()
            .copied()
            .filter(|&i| entities[i].category == Category::Species)
            .collect();

        for &idx in member_idxs {
            if entities[idx].category == Category::Species {
                continue;
            }

            let base = if entities[idx].category == Category::Spuh {
                family_max
            } else {
                let by_banding = species_idxs
                    .iter()
                    .filter(|&&sp| {
                        codes_overlap(&entities[idx].com_name_codes, &entities[sp].banding_codes)
                    })
                    .map(|&sp| entities[sp].nacc_sort_order)
                    .fold(f64::NEG_INFINITY, f64::max);
                if by_banding.is_finite() {
                    by_banding
                } else {
                    let by_com_name = species_idxs
                        .iter()
                        .filter(|&&sp| {
                            codes_overlap(
                                &entities[idx].com_name_codes,
                                &entities[sp].com_name_codes,
                            )
                        })
                        .map(|&sp| entities[sp].nacc_sort_order)
                        .fold(f64::NEG_INFINITY, f64::max);
                    if by_com_name.is_finite() {
                        by_com_name
                    } else {
                        family_max
                    }
                }
            };

            if base > 0.0 {
                pending.push((idx, base));
            }
        }
    }

    // Smear equal bases across a fractional range to keep a strict order
    pending.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut run_start = 0;
    while run_start < pending.len() {
        let base = pending[run_start].1;
        let mut run_end = run_start;
        while run_end < pending.len() && pending[run_end].1 == base {
            run_end += 1;
        }
        let count = run_end - run_start;
        let step = if count > 9 { 0.01 } else { 0.1 };
        for (offset, &(idx, _)) in pending[run_start..run_end].iter().enumerate() {
            entities[idx].nacc_sort_order = base + step * (offset as f64 + 1.0);
        }
        run_start = run_end;
    }
}
