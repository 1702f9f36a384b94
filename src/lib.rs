//! Checklist Normalizer
//!
//! Reconciles noisy, human-transcribed bird checklists (scanned tally
//! sheets, OCR'd PDFs, spreadsheet extracts) against the eBird/Clements
//! taxonomy, producing a normalized (CommonName, Total) checklist for
//! downstream reporting.
//!
//! - `taxonomy`: reference list loading, merging and lookup
//! - `translation`: layered local-name rewrite rules
//! - `text_transform`: staged lexical cleanup of raw lines
//! - `token_matcher`: vocabulary filtering, fuzzy and entity matching
//! - `checklist`: the assembler driving the full pipeline
//! - `overlays`: exceptions and rarity adjustments

pub mod cache;
pub mod checklist;
pub mod config;
pub mod overlays;
pub mod taxonomy;
pub mod text_transform;
pub mod token_matcher;
pub mod translation;

// Re-export commonly used types
pub use checklist::{
    extract_records, sanitize_total, ChecklistAssembler, ChecklistResult, ChecklistRow,
    LineOutcome, RawRecord,
};
pub use config::PipelineConfig;
pub use taxonomy::{Category, TaxonEntity, Taxonomy, TaxonomyLoadError, TaxonomySources};
pub use text_transform::{
    normalize_line, pre_process_line, secondary_species_processing, tertiary_transformation,
};
pub use token_matcher::TokenMatcher;
pub use translation::{TranslationContext, TranslationRule};
