//! Checklist Assembler
//!
//! Drives the normalizer, translation context and taxonomy to turn one
//! input source (a scanned sheet's raw line list, or a tabular
//! species/count extraction) into a final deduplicated checklist of
//! (CommonName, Total) rows.
//!
//! Each line runs an explicit state machine:
//! `Raw -> Normalized -> Translated(pass1) -> Translated(pass2) ->
//! {Resolved | UnresolvedCandidate}` and
//! `UnresolvedCandidate -> {ResolvedByFallback | Rejected}`.
//! A `Rejected` line terminates that line only, never the batch; rejected
//! names are reported for operator review and excluded from the output.

use anyhow::{bail, Context, Result};
use polars::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::config::PipelineConfig;
use crate::overlays::Exceptions;
use crate::taxonomy::{Category, Taxonomy, MISSING_TAXON_ORDER};
use crate::text_transform::{normalize_line, strip_scientific_suffix};
use crate::translation::TranslationContext;

/// Header synonyms recognized for the species-name column.
const COMMON_NAME_HEADERS: &[&str] = &["CommonName", "Common Name", "species", "SPECIES", "Species"];

/// Header synonyms recognized for the count column. A frozen-formula
/// column is preferred when present.
const TOTAL_HEADERS: &[&str] = &["Total", "total", "Number"];
const FROZEN_TOTAL_HEADER: &str = "FrozenTotal";

/// Bare annotations that inherit the nearest prior resolved species.
const INHERITING_ANNOTATIONS: &[&str] = &["(immature)", "(form unidentified)"];

/// One extracted input row, before any resolution.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub name: String,
    pub total_text: String,
}

impl RawRecord {
    pub fn new(name: &str, total_text: &str) -> Self {
        RawRecord {
            name: name.to_string(),
            total_text: total_text.to_string(),
        }
    }
}

/// Terminal state of one line's resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Resolved,
    ResolvedByFallback,
    Rejected,
}

/// Resolution provenance for one input line.
#[derive(Debug, Clone)]
pub struct LineTrace {
    pub original: String,
    pub normalized: String,
    pub translated: String,
    pub resolved: Option<String>,
    pub outcome: LineOutcome,
}

/// One assembled checklist row.
#[derive(Debug, Clone)]
pub struct ChecklistRow {
    pub common_name: String,
    pub total: i64,
    pub taxon_order: i64,
    pub rare: bool,
    /// The total came from an "X" (present but uncounted) marker and
    /// needs manual correction.
    pub uncounted: bool,
}

/// Assembled checklist plus everything an operator needs to review.
#[derive(Debug)]
pub struct ChecklistResult {
    /// Deduplicated rows sorted by taxonomic order.
    pub rows: Vec<ChecklistRow>,
    /// Original text of lines that failed every resolution attempt.
    pub unresolved: Vec<String>,
    pub traces: Vec<LineTrace>,
}

/// Coerce a count field to a non-negative total.
///
/// Thousands separators are accepted; any other non-numeric annotation
/// ("CW", "Miss") coerces to zero. A literal "X" is eBird's present but
/// uncounted marker and maps to the configured placeholder value; the
/// second return flags it for manual correction.
pub fn sanitize_total(total_text: &str, config: &PipelineConfig) -> (i64, bool) {
    let trimmed = total_text.trim();
    if trimmed.is_empty() {
        return (0, false);
    }
    if trimmed.eq_ignore_ascii_case("x") {
        return (config.uncounted_marker_value, true);
    }
    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || c == ',' || c == '.'))
    {
        return (0, false);
    }
    let cleaned = trimmed.replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(value) if value >= 0.0 => (value as i64, false),
        _ => (0, false),
    }
}

fn column_as_strings(df: &DataFrame, idx: usize) -> Result<Vec<String>> {
    let col = df.get_columns()[idx]
        .cast(&DataType::String)
        .with_context(|| format!("Column {} not castable to string", idx))?;
    let ca = col.str()?;
    Ok(ca
        .into_iter()
        .map(|opt| opt.unwrap_or("").trim().to_string())
        .collect())
}

/// Detect the species/count column layout and extract typed records.
///
/// Header synonyms may appear as real column headers, or buried in a
/// header row partway down an unstructured sheet; rows are taken until
/// the first blank species cell.
pub fn extract_records(df: &DataFrame) -> Result<Vec<RawRecord>> {
    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    if let Some(species_col) = column_names
        .iter()
        .position(|name| COMMON_NAME_HEADERS.contains(&name.as_str()))
    {
        let species = column_as_strings(df, species_col)?;
        let cut = species
            .iter()
            .position(|s| s.is_empty())
            .unwrap_or(species.len());

        let totals_col = if column_names.iter().any(|n| n == FROZEN_TOTAL_HEADER) {
            column_names.iter().position(|n| n == FROZEN_TOTAL_HEADER)
        } else {
            column_names
                .iter()
                .position(|name| TOTAL_HEADERS.contains(&name.as_str()))
        };
        let totals = match totals_col {
            Some(idx) => column_as_strings(df, idx)?,
            None => vec![String::new(); species.len()],
        };

        let empty = String::new();
        return Ok(species[..cut]
            .iter()
            .zip(totals.iter().chain(std::iter::repeat(&empty)))
            .map(|(name, total)| RawRecord::new(name, total))
            .collect());
    }

    // No recognizable headers: scan the cells for a header row
    let cells: Vec<Vec<String>> = (0..df.width())
        .map(|idx| column_as_strings(df, idx))
        .collect::<Result<_>>()?;
    if cells.is_empty() {
        bail!("table has no columns");
    }
    let height = df.height();

    let mut species_header: Option<(usize, usize)> = None;
    'species: for row in 0..height {
        for (col, values) in cells.iter().enumerate() {
            if COMMON_NAME_HEADERS.contains(&values[row].as_str()) {
                species_header = Some((row, col));
                break 'species;
            }
        }
    }
    let (species_row, species_col) =
        species_header.ok_or_else(|| anyhow::anyhow!("no species column recognized"))?;

    let species: Vec<&String> = cells[species_col][species_row + 1..].iter().collect();
    let cut = species
        .iter()
        .position(|s| s.is_empty())
        .unwrap_or(species.len());

    let mut totals_header: Option<(usize, usize)> = None;
    'totals: for row in 0..height {
        for (col, values) in cells.iter().enumerate() {
            if TOTAL_HEADERS.contains(&values[row].as_str()) {
                totals_header = Some((row, col));
                break 'totals;
            }
        }
    }

    let records = species[..cut]
        .iter()
        .enumerate()
        .map(|(offset, name)| {
            let total = totals_header
                .and_then(|(row, col)| cells[col].get(row + 1 + offset))
                .cloned()
                .unwrap_or_default();
            RawRecord::new(name, &total)
        })
        .collect();

    Ok(records)
}

/// Orchestrates the full pipeline over one input source.
///
/// Holds only shared references; the reference objects are read-only and
/// one assembler can serve many checklists, in parallel.
pub struct ChecklistAssembler<'a> {
    taxonomy: &'a Taxonomy,
    translations: &'a TranslationContext,
    config: &'a PipelineConfig,
}

impl<'a> ChecklistAssembler<'a> {
    pub fn new(
        taxonomy: &'a Taxonomy,
        translations: &'a TranslationContext,
        config: &'a PipelineConfig,
    ) -> Self {
        ChecklistAssembler {
            taxonomy,
            translations,
            config,
        }
    }

    /// Assemble a deduplicated checklist from extracted records.
    pub fn assemble(&self, records: &[RawRecord]) -> ChecklistResult {
        let mut traces: Vec<LineTrace> = Vec::with_capacity(records.len());

        for record in records {
            let trace = self.resolve_line(record, &traces);
            traces.push(trace);
        }

        let mut unresolved = Vec::new();
        for trace in &traces {
            if trace.outcome == LineOutcome::Rejected && !trace.normalized.is_empty() {
                tracing::warn!("No translation found for: {}", trace.original);
                unresolved.push(trace.original.clone());
            }
        }

        // 'Bald Eagle', 'Bald Eagle (Adult)' and 'Bald Eagle (Immature)'
        // may all resolve to 'Bald Eagle'; sum the totals into one row
        let mut merged: FxHashMap<String, ChecklistRow> = FxHashMap::default();
        for (trace, record) in traces.iter().zip(records) {
            let name = match &trace.resolved {
                Some(name) if !name.is_empty() => name.clone(),
                _ => continue,
            };
            let (total, uncounted) = sanitize_total(&record.total_text, self.config);
            let taxon_order = self
                .taxonomy
                .find_by_common_name(&name)
                .map(|e| e.taxon_order)
                .unwrap_or(MISSING_TAXON_ORDER);
            let row = merged.entry(name.clone()).or_insert(ChecklistRow {
                common_name: name,
                total: 0,
                taxon_order,
                rare: false,
                uncounted: false,
            });
            row.total += total;
            if uncounted && self.config.flag_uncounted {
                row.uncounted = true;
            }
        }

        let mut rows: Vec<ChecklistRow> = merged.into_values().collect();
        rows.sort_by(|a, b| {
            a.taxon_order
                .cmp(&b.taxon_order)
                .then_with(|| a.common_name.cmp(&b.common_name))
        });

        ChecklistResult {
            rows,
            unresolved,
            traces,
        }
    }

    /// Assemble independent checklists in parallel. The taxonomy and
    /// translation context are shared read-only, not copied.
    pub fn assemble_many(&self, batches: &[Vec<RawRecord>]) -> Vec<ChecklistResult> {
        batches
            .par_iter()
            .map(|records| self.assemble(records))
            .collect()
    }

    /// Build a full tally-sheet template: every candidate species with a
    /// zero total, exceptions applied, base species added for any issf
    /// entry, sorted by taxonomic order with duplicates dropped.
    pub fn build_species_template(
        &self,
        lines: &[String],
        exceptions: Option<&Exceptions>,
    ) -> Vec<ChecklistRow> {
        let mut candidates: Vec<String> = lines
            .iter()
            .map(|line| {
                self.translations
                    .double_translate(&normalize_line(line))
            })
            .filter(|name| !name.is_empty())
            .collect();

        if let Some(exceptions) = exceptions {
            candidates = exceptions.apply(&candidates);
        }

        // If an issf is listed, its base species must be listed too
        for issf in self.taxonomy.filter_issf(&candidates) {
            if let Some(base) = self.taxonomy.report_as(&issf) {
                candidates.push(base.to_string());
            }
        }

        let mut rows: Vec<ChecklistRow> = candidates
            .iter()
            .filter_map(|name| self.taxonomy.find_by_common_name(name))
            .map(|entity| ChecklistRow {
                common_name: entity.com_name.clone(),
                total: 0,
                taxon_order: entity.taxon_order,
                rare: false,
                uncounted: false,
            })
            .collect();

        rows.sort_by(|a, b| {
            a.taxon_order
                .cmp(&b.taxon_order)
                .then_with(|| a.common_name.cmp(&b.common_name))
        });
        rows.dedup_by(|a, b| a.common_name == b.common_name);
        rows
    }

    /// Run one line through the resolution state machine.
    ///
    /// `prior_traces` is the input-ordered trace list so far; the
    /// base-species fallback walks it backward, which makes the outcome
    /// deliberately input-order dependent.
    fn resolve_line(&self, record: &RawRecord, prior_traces: &[LineTrace]) -> LineTrace {
        let normalized =
            strip_scientific_suffix(&normalize_line(&record.name), self.taxonomy);

        // Direct lookup
        if let Some(entity) = self.taxonomy.find_by_common_name(&normalized) {
            return LineTrace {
                original: record.name.clone(),
                normalized: normalized.clone(),
                translated: normalized,
                resolved: Some(entity.com_name.clone()),
                outcome: LineOutcome::Resolved,
            };
        }

        // First translation pass
        let (pass1, _) = self.translations.apply_translations(&normalized);
        if let Some(entity) = self.taxonomy.find_by_common_name(&pass1) {
            return LineTrace {
                original: record.name.clone(),
                normalized,
                translated: pass1,
                resolved: Some(entity.com_name.clone()),
                outcome: LineOutcome::Resolved,
            };
        }

        // Second pass on the first pass's output
        let (pass2, _) = self.translations.apply_translations(&pass1);
        if let Some(entity) = self.taxonomy.find_by_common_name(&pass2) {
            return LineTrace {
                original: record.name.clone(),
                normalized,
                translated: pass2,
                resolved: Some(entity.com_name.clone()),
                outcome: LineOutcome::Resolved,
            };
        }

        // Base-species inference from the nearest prior resolved line
        if let Some(base) = self.find_base_species(prior_traces) {
            let raw = record.name.trim().to_lowercase();
            if INHERITING_ANNOTATIONS.contains(&raw.as_str()) {
                return LineTrace {
                    original: record.name.clone(),
                    normalized,
                    translated: pass2,
                    resolved: Some(base),
                    outcome: LineOutcome::ResolvedByFallback,
                };
            }
            // The line may be a variant annotation of the base species
            let candidate = format!("{} {}", base, record.name.trim());
            if let Some(entity) = self.taxonomy.find_by_common_name(&candidate) {
                return LineTrace {
                    original: record.name.clone(),
                    normalized,
                    translated: pass2,
                    resolved: Some(entity.com_name.clone()),
                    outcome: LineOutcome::ResolvedByFallback,
                };
            }
        }

        LineTrace {
            original: record.name.clone(),
            normalized,
            translated: pass2,
            resolved: None,
            outcome: LineOutcome::Rejected,
        }
    }

    /// Walk backward through the input-ordered traces for the nearest
    /// resolved line; a non-species entry contributes its `reportAs`
    /// parent.
    fn find_base_species(&self, prior_traces: &[LineTrace]) -> Option<String> {
        for trace in prior_traces.iter().rev() {
            let name = match &trace.resolved {
                Some(name) => name,
                None => continue,
            };
            let entity = self.taxonomy.find_by_common_name(name)?;
            return if entity.category == Category::Species {
                Some(entity.com_name.clone())
            } else {
                self.taxonomy.report_as(name).map(|s| s.to_string())
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::TaxonEntity;
    use crate::translation::{RuleSource, TranslationRule};

    fn make(
        com_name: &str,
        sci_name: &str,
        code: &str,
        category: Category,
        taxon_order: i64,
    ) -> TaxonEntity {
        TaxonEntity {
            com_name: com_name.to_string(),
            sci_name: sci_name.to_string(),
            species_code: code.to_string(),
            category,
            taxon_order,
            order: "Anseriformes".to_string(),
            family_com_name: "Waterfowl".to_string(),
            family_sci_name: "Anatidae".to_string(),
            report_as: None,
            banding_codes: Vec::new(),
            com_name_codes: Vec::new(),
            ioc_sort_order: 0,
            nacc_sort_order: 0.0,
        }
    }

    fn sample_taxonomy() -> Taxonomy {
        let mut bewicks = make(
            "Tundra Swan (Bewick's)",
            "Cygnus columbianus bewickii",
            "tunswa1",
            Category::Issf,
            216,
        );
        bewicks.report_as = Some("tunswa".to_string());

        Taxonomy::from_entities(vec![
            make("Tundra Swan", "Cygnus columbianus", "tunswa", Category::Species, 215),
            bewicks,
            make("Bufflehead", "Bucephala albeola", "buffle", Category::Species, 490),
            make("Bald Eagle", "Haliaeetus leucocephalus", "baleag", Category::Species, 700),
            make(
                "Glaucous-winged Gull",
                "Larus glaucescens",
                "glwgul",
                Category::Species,
                1100,
            ),
            make(
                "California Quail",
                "Callipepla californica",
                "calqua",
                Category::Species,
                40,
            ),
        ])
        .unwrap()
    }

    fn literal(pattern: &str, replacement: &str) -> TranslationRule {
        TranslationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            match_whole_line: false,
            is_regex: false,
            source: RuleSource::SystemDefault,
        }
    }

    #[test]
    fn test_sanitize_total() {
        let config = PipelineConfig::default();
        assert_eq!(sanitize_total("1,234", &config), (1234, false));
        assert_eq!(sanitize_total("CW", &config), (0, false));
        assert_eq!(sanitize_total("X", &config), (3, true));
        assert_eq!(sanitize_total("", &config), (0, false));
        assert_eq!(sanitize_total("42", &config), (42, false));
        assert_eq!(sanitize_total("  7 ", &config), (7, false));
    }

    #[test]
    fn test_sanitize_total_uses_configured_marker() {
        let config = PipelineConfig {
            uncounted_marker_value: 1,
            ..PipelineConfig::default()
        };
        assert_eq!(sanitize_total("X", &config), (1, true));
    }

    #[test]
    fn test_extract_records_with_headers() {
        let df = df![
            "Species" => &["Bufflehead", "Bald Eagle", "", "notes below the blank"],
            "Total" => &["12", "X", "", ""],
        ]
        .unwrap();
        let records = extract_records(&df).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Bufflehead");
        assert_eq!(records[0].total_text, "12");
        assert_eq!(records[1].total_text, "X");
    }

    #[test]
    fn test_extract_records_prefers_frozen_total() {
        let df = df![
            "CommonName" => &["Bufflehead"],
            "Total" => &["1"],
            "FrozenTotal" => &["99"],
        ]
        .unwrap();
        let records = extract_records(&df).unwrap();
        assert_eq!(records[0].total_text, "99");
    }

    #[test]
    fn test_extract_records_scans_for_header_row() {
        let df = df![
            "column_1" => &["Count Circle XYZ", "SPECIES", "Bufflehead", "Bald Eagle", ""],
            "column_2" => &["", "Total", "12", "3", ""],
        ]
        .unwrap();
        let records = extract_records(&df).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Bufflehead");
        assert_eq!(records[0].total_text, "12");
        assert_eq!(records[1].name, "Bald Eagle");
        assert_eq!(records[1].total_text, "3");
    }

    #[test]
    fn test_extract_records_without_species_column_fails() {
        let df = df![
            "a" => &["x"],
            "b" => &["y"],
        ]
        .unwrap();
        assert!(extract_records(&df).is_err());
    }

    #[test]
    fn test_assemble_merges_duplicate_names() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(vec![
            literal("bald eagle (adult)", "bald eagle"),
            literal("bald eagle (immature)", "bald eagle"),
        ]);
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![
            RawRecord::new("Bald Eagle (Adult)", "3"),
            RawRecord::new("Bald Eagle (Immature)", "2"),
            RawRecord::new("Bald Eagle", "1"),
        ];
        let result = assembler.assemble(&records);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].common_name, "Bald Eagle");
        assert_eq!(result.rows[0].total, 6);
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn test_assemble_strips_scientific_suffix() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![RawRecord::new("California Quail Callipepla californica", "4")];
        let result = assembler.assemble(&records);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].common_name, "California Quail");
        assert_eq!(result.rows[0].total, 4);
    }

    #[test]
    fn test_fallback_inheritance_follows_input_order() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![
            RawRecord::new("Tundra Swan", "2"),
            RawRecord::new("(immature)", "1"),
        ];
        let result = assembler.assemble(&records);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].common_name, "Tundra Swan");
        assert_eq!(result.rows[0].total, 3);

        let trace = &result.traces[1];
        assert_eq!(trace.outcome, LineOutcome::ResolvedByFallback);

        // Reversed input order: nothing resolved before the annotation, so
        // it is rejected instead of inheriting
        let reversed = vec![
            RawRecord::new("(immature)", "1"),
            RawRecord::new("Tundra Swan", "2"),
        ];
        let result = assembler.assemble(&reversed);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].total, 2);
        assert_eq!(result.traces[0].outcome, LineOutcome::Rejected);
    }

    #[test]
    fn test_fallback_through_non_species_uses_report_as() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![
            RawRecord::new("Tundra Swan (Bewick's)", "2"),
            RawRecord::new("(immature)", "1"),
        ];
        let result = assembler.assemble(&records);
        // The annotation inherits the issf's base species
        let swan = result
            .rows
            .iter()
            .find(|r| r.common_name == "Tundra Swan")
            .unwrap();
        assert_eq!(swan.total, 1);
    }

    #[test]
    fn test_unresolved_lines_are_reported_not_dropped_silently() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![
            RawRecord::new("Bufflehead", "2"),
            RawRecord::new("Dodo", "1"),
        ];
        let result = assembler.assemble(&records);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.unresolved, vec!["Dodo".to_string()]);
    }

    #[test]
    fn test_uncounted_marker_flags_row() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![RawRecord::new("Bufflehead", "X")];
        let result = assembler.assemble(&records);
        assert_eq!(result.rows[0].total, 3);
        assert!(result.rows[0].uncounted);
    }

    #[test]
    fn test_rows_sorted_by_taxon_order() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let records = vec![
            RawRecord::new("Glaucous-winged Gull", "5"),
            RawRecord::new("California Quail", "2"),
            RawRecord::new("Bufflehead", "1"),
        ];
        let result = assembler.assemble(&records);
        let names: Vec<&str> = result.rows.iter().map(|r| r.common_name.as_str()).collect();
        assert_eq!(names, vec!["California Quail", "Bufflehead", "Glaucous-winged Gull"]);
    }

    #[test]
    fn test_assemble_many_matches_sequential() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let batches = vec![
            vec![RawRecord::new("Bufflehead", "2")],
            vec![RawRecord::new("Tundra Swan", "4")],
        ];
        let results = assembler.assemble_many(&batches);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows[0].common_name, "Bufflehead");
        assert_eq!(results[1].rows[0].common_name, "Tundra Swan");
    }

    #[test]
    fn test_build_species_template_adds_issf_base() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let lines = vec!["Tundra Swan (Bewick's)".to_string()];
        let rows = assembler.build_species_template(&lines, None);
        let names: Vec<&str> = rows.iter().map(|r| r.common_name.as_str()).collect();
        assert_eq!(names, vec!["Tundra Swan", "Tundra Swan (Bewick's)"]);
        assert!(rows.iter().all(|r| r.total == 0));
    }

    #[test]
    fn test_build_species_template_applies_exceptions() {
        let taxonomy = sample_taxonomy();
        let translations = TranslationContext::from_rules(Vec::new());
        let config = PipelineConfig::default();
        let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);

        let mut exceptions = Exceptions::default();
        exceptions.additions.insert("Bald Eagle".to_string());
        exceptions.subtractions.insert("Bufflehead".to_string());

        let lines = vec!["Bufflehead".to_string(), "Tundra Swan".to_string()];
        let rows = assembler.build_species_template(&lines, Some(&exceptions));
        let names: Vec<&str> = rows.iter().map(|r| r.common_name.as_str()).collect();
        assert_eq!(names, vec!["Tundra Swan", "Bald Eagle"]);
    }
}
