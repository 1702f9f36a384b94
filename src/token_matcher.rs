//! Token / Fuzzy Matcher
//!
//! Classifies free-text lines as likely-species vs. noise and extracts
//! taxonomic entity spans from blocks of text.
//!
//! A word vocabulary is derived from the taxonomy once per run (and cached
//! to disk keyed by the taxonomy content hash). Lines whose token overlap
//! with that vocabulary is too small are filtered out before the expensive
//! fuzzy and phrase matching passes run.
//!
//! Nothing in this module raises on absence of a match; every operation
//! returns empty collections.

use ahash::AHashSet;
use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::Path;

use crate::cache;
use crate::config::PipelineConfig;
use crate::taxonomy::{Category, TaxonEntity, Taxonomy};
use crate::translation::TranslationContext;

/// Embedded English stop words; the taxonomy vocabulary and candidate
/// lines are full sentences often enough that these matter.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "nor", "but", "if", "then", "than", "so", "too", "very",
    "of", "in", "on", "at", "by", "for", "with", "to", "from", "as", "into", "onto", "about",
    "against", "between", "through", "during", "before", "after", "above", "below", "over",
    "under", "up", "down", "out", "off", "again", "further", "once", "here", "there", "where",
    "when", "which", "who", "whom", "whose", "what", "why", "how", "all", "any", "both",
    "each", "few", "more", "most", "other", "some", "such", "only", "own", "same", "also",
    "just", "is", "are", "was", "were", "be", "been", "being", "am", "do", "does", "did",
    "done", "have", "has", "had", "having", "can", "could", "will", "would", "shall",
    "should", "may", "might", "must", "this", "that", "these", "those", "it", "its", "he",
    "she", "they", "them", "his", "her", "their", "we", "our", "you", "your", "i", "me",
    "my", "no", "not",
];

/// Domain stop words: words that appear all over count-day text without
/// identifying anything.
const BIRD_STOP_WORDS: &[&str] = &["bird", "birds", "summer"];

/// Short tokens that produce accidental matches (ordinal fragments, unit
/// abbreviations); removed from the vocabulary along with all
/// single-character tokens.
const TOKENS_TO_DROP: &[&str] = &[
    "'s", "10", "11", "al", "f1", "f2", "is", "la", "mt", "of", "oo", "or", "ou", "sp", "ua",
];

/// Punctuation that marks a phrase boundary inside a fuzzy match window.
const BOUNDARY_PUNCTUATION: &[char] = &[',', '!', '?', '{', '}', '[', ']'];

/// Which taxonomy name field an entity pattern came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameField {
    Common,
    Scientific,
    FamilyCommon,
    FamilyScientific,
    Order,
}

impl NameField {
    /// Field order is the match-preference order: common name first.
    pub const PREFERENCE_ORDER: [NameField; 5] = [
        NameField::Common,
        NameField::Scientific,
        NameField::FamilyCommon,
        NameField::FamilyScientific,
        NameField::Order,
    ];

    fn prefix(&self) -> &'static str {
        match self {
            NameField::Common => "COM",
            NameField::Scientific => "SCI",
            NameField::FamilyCommon => "FAMCOM",
            NameField::FamilyScientific => "FAMSCI",
            NameField::Order => "ORD",
        }
    }

    fn value<'a>(&self, entity: &'a TaxonEntity) -> &'a str {
        match self {
            NameField::Common => &entity.com_name,
            NameField::Scientific => &entity.sci_name,
            NameField::FamilyCommon => &entity.family_com_name,
            NameField::FamilyScientific => &entity.family_sci_name,
            NameField::Order => &entity.order,
        }
    }
}

/// Label class for a tagged span: one of 40 (5 name fields x 8
/// categories) exact classes, e.g. "COMSPECIES", plus the two fuzzy
/// fallback classes.
pub fn label_code(field: NameField, category: Category) -> String {
    format!("{}{}", field.prefix(), category.as_str().to_uppercase())
}

pub const FUZZY_COMMON_LABEL: &str = "FUZZYCOM";
pub const FUZZY_SCIENTIFIC_LABEL: &str = "FUZZYSCI";

/// Whether a span came from the exact phrase matcher or a fuzzy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// A tagged entity span over document tokens (token indices, end
/// exclusive).
#[derive(Debug, Clone)]
pub struct EntitySpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub label: String,
    pub kind: MatchKind,
}

/// One fuzzy phrase hit.
#[derive(Debug, Clone)]
pub struct FuzzyMatch {
    pub matched_text: String,
    pub phrase: String,
    pub start: usize,
    pub end: usize,
    pub similarity: f64,
}

/// One line of the categorized-lines review report.
#[derive(Debug, Clone)]
pub struct CategorizedLine {
    pub line: String,
    pub translation: String,
    pub translated: bool,
    pub category: String,
}

/// Cached taxonomy-derived artifacts.
#[derive(Serialize, Deserialize)]
struct PatternArtifacts {
    /// (normalized phrase, label code), in registration order
    patterns: Vec<(String, String)>,
    vocabulary: Vec<String>,
    common_names: Vec<String>,
    scientific_names: Vec<String>,
}

/// Tokenize for vocabulary and exact phrase matching: lowercase words with
/// surrounding punctuation stripped, apostrophes and internal hyphens kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !(c.is_alphanumeric() || c == '\''))
                .to_string()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Tokenize a document for fuzzy windowing: punctuation characters become
/// their own tokens so phrase boundaries stay visible.
fn doc_tokenize(document: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in document.split_whitespace() {
        let mut current = String::new();
        for c in word.chars() {
            if c.is_alphanumeric() || c == '\'' || c == '-' {
                current.push(c);
            } else {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

fn normalize_phrase(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Taxonomy-derived token matcher. Immutable for the run; safe to share
/// across parallel workers.
pub struct TokenMatcher {
    stop_words: AHashSet<String>,
    vocabulary: AHashSet<String>,
    /// normalized phrase -> (label code, registration order)
    exact_patterns: FxHashMap<String, (String, usize)>,
    /// Distinct pattern word counts, longest first
    pattern_word_counts: Vec<usize>,
    common_names: Vec<String>,
    scientific_names: Vec<String>,
    possible_line_threshold: f64,
    fuzzy_similarity_threshold: f64,
}

impl TokenMatcher {
    /// Build the matcher from the taxonomy, reusing the disk cache when
    /// `cache_dir` is given and the taxonomy was loaded through its cache.
    pub fn new(
        taxonomy: &Taxonomy,
        config: &PipelineConfig,
        cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let artifacts = match (cache_dir, taxonomy.cache_key()) {
            (Some(dir), Some(key)) => {
                let cache_path = dir.join(format!("entity_patterns-{}.json", &key[..16]));
                cache::load_or_build(&cache_path, || Ok(build_artifacts(taxonomy)))?
            }
            _ => build_artifacts(taxonomy),
        };

        let mut stop_words: AHashSet<String> = STOP_WORDS
            .iter()
            .chain(BIRD_STOP_WORDS.iter())
            .map(|s| s.to_string())
            .collect();
        for word in &config.extra_stop_words {
            stop_words.insert(word.to_lowercase());
        }

        let mut exact_patterns = FxHashMap::default();
        let mut word_counts: Vec<usize> = Vec::new();
        for (order, (phrase, label)) in artifacts.patterns.iter().enumerate() {
            let count = phrase.split(' ').count();
            if !word_counts.contains(&count) {
                word_counts.push(count);
            }
            exact_patterns
                .entry(phrase.clone())
                .or_insert((label.clone(), order));
        }
        word_counts.sort_unstable_by(|a, b| b.cmp(a));

        Ok(TokenMatcher {
            stop_words,
            vocabulary: artifacts.vocabulary.into_iter().collect(),
            exact_patterns,
            pattern_word_counts: word_counts,
            common_names: artifacts.common_names,
            scientific_names: artifacts.scientific_names,
            possible_line_threshold: config.possible_line_threshold,
            fuzzy_similarity_threshold: config.fuzzy_similarity_threshold,
        })
    }

    /// Cheap pre-filter: keep only lines whose fraction of
    /// vocabulary-known tokens is strictly above the threshold.
    ///
    /// A line with zero tokens is skipped, not matched.
    pub fn filter_to_possibles(&self, lines: &[String]) -> AHashSet<String> {
        let mut possibles = AHashSet::new();

        for line in lines {
            let line_tokens: AHashSet<String> = tokenize(line).into_iter().collect();
            if line_tokens.is_empty() {
                continue;
            }
            let known = line_tokens
                .iter()
                .filter(|t| self.vocabulary.contains(*t) && !self.stop_words.contains(*t))
                .count();
            let fraction = known as f64 / line_tokens.len() as f64;
            if fraction > self.possible_line_threshold {
                possibles.insert(line.clone());
            }
        }

        possibles
    }

    /// Slide a token window sized per phrase across the document and keep
    /// windows whose normalized edit-distance similarity (0-100) is
    /// strictly above the threshold. A window containing phrase-boundary
    /// punctuation is abandoned.
    pub fn fuzzy_phrase_match(&self, phrases: &[String], document: &str) -> Vec<FuzzyMatch> {
        let tokens = doc_tokenize(&document.to_lowercase());
        let mut matches = Vec::new();

        for phrase in phrases {
            let phrase = phrase.to_lowercase();
            let phrase_len = phrase.split(' ').count();
            if phrase.is_empty() || phrase_len == 0 || tokens.len() < phrase_len {
                continue;
            }

            for start in 0..=(tokens.len() - phrase_len) {
                let window: SmallVec<[&str; 8]> = tokens[start..start + phrase_len]
                    .iter()
                    .map(|t| t.as_str())
                    .collect();
                if window
                    .iter()
                    .any(|t| t.chars().any(|c| BOUNDARY_PUNCTUATION.contains(&c)))
                {
                    continue;
                }
                let candidate = window.join(" ");
                let similarity = strsim::normalized_levenshtein(&candidate, &phrase) * 100.0;
                if similarity > self.fuzzy_similarity_threshold {
                    matches.push(FuzzyMatch {
                        matched_text: candidate,
                        phrase: phrase.clone(),
                        start,
                        end: start + phrase_len,
                        similarity,
                    });
                }
            }
        }

        matches
    }

    /// Tag taxonomic entity spans in a block of text.
    ///
    /// Exact phrase matches take precedence over fuzzy matches covering
    /// the same token range; longer spans beat shorter ones; the
    /// first-registered pattern wins an exact tie.
    pub fn tag_entities(&self, text: &str, use_fuzzy: bool) -> Vec<EntitySpan> {
        let clean_tokens = tokenize(text);
        if clean_tokens.is_empty() {
            return Vec::new();
        }

        // (kind rank, span, registration order)
        let mut candidates: Vec<(usize, EntitySpan, usize)> = Vec::new();

        for &word_count in &self.pattern_word_counts {
            if word_count == 0 || clean_tokens.len() < word_count {
                continue;
            }
            for start in 0..=(clean_tokens.len() - word_count) {
                let phrase = clean_tokens[start..start + word_count].join(" ");
                if let Some((label, order)) = self.exact_patterns.get(&phrase) {
                    candidates.push((
                        0,
                        EntitySpan {
                            start,
                            end: start + word_count,
                            text: phrase,
                            label: label.clone(),
                            kind: MatchKind::Exact,
                        },
                        *order,
                    ));
                }
            }
        }

        if use_fuzzy {
            let document = clean_tokens.join(" ");
            for (phrases, label) in [
                (&self.common_names, FUZZY_COMMON_LABEL),
                (&self.scientific_names, FUZZY_SCIENTIFIC_LABEL),
            ] {
                for m in self.fuzzy_phrase_match(phrases, &document) {
                    candidates.push((
                        1,
                        EntitySpan {
                            start: m.start,
                            end: m.end,
                            text: m.matched_text,
                            label: label.to_string(),
                            kind: MatchKind::Fuzzy,
                        },
                        usize::MAX,
                    ));
                }
            }
        }

        // Exact before fuzzy, longer before shorter, then document order,
        // then registration order
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then((b.1.end - b.1.start).cmp(&(a.1.end - a.1.start)))
                .then(a.1.start.cmp(&b.1.start))
                .then(a.2.cmp(&b.2))
        });

        let mut claimed: AHashSet<usize> = AHashSet::new();
        let mut spans = Vec::new();
        for (_, span, _) in candidates {
            if (span.start..span.end).any(|idx| claimed.contains(&idx)) {
                continue;
            }
            claimed.extend(span.start..span.end);
            spans.push(span);
        }

        spans.sort_by_key(|span| span.start);
        spans
    }

    /// Per-line review report: each unique line with its double
    /// translation and the entity class the translated line lands in.
    pub fn categorize_lines(
        &self,
        lines: &[String],
        translation_context: &TranslationContext,
    ) -> Vec<CategorizedLine> {
        let mut unique: Vec<String> = lines
            .iter()
            .map(|l| l.to_lowercase())
            .collect::<AHashSet<_>>()
            .into_iter()
            .collect();
        unique.sort();

        unique
            .into_iter()
            .map(|line| {
                let translation = translation_context.double_translate(&line);
                let translated = translation != line;
                let category = self
                    .tag_entities(&translation, false)
                    .into_iter()
                    .max_by_key(|span| span.end - span.start)
                    .map(|span| span.label)
                    .unwrap_or_default();
                CategorizedLine {
                    line,
                    translation,
                    translated,
                    category,
                }
            })
            .collect()
    }
}

/// Derive the entity patterns and token vocabulary from the taxonomy.
///
/// A name string registers only for the first (category, field) class that
/// claims it, walking categories in preference order and fields
/// common-name first.
fn build_artifacts(taxonomy: &Taxonomy) -> PatternArtifacts {
    let mut accumulation: AHashSet<String> = AHashSet::new();
    let mut patterns: Vec<(String, String)> = Vec::new();

    for category in Category::PREFERENCE_ORDER {
        for field in NameField::PREFERENCE_ORDER {
            for entity in taxonomy.entities() {
                if entity.category != category {
                    continue;
                }
                let phrase = normalize_phrase(field.value(entity));
                if phrase.is_empty() || accumulation.contains(&phrase) {
                    continue;
                }
                accumulation.insert(phrase.clone());
                patterns.push((phrase, label_code(field, category)));
            }
        }
    }

    let mut vocabulary: AHashSet<String> = AHashSet::new();
    for entity in taxonomy.entities() {
        for name in [
            &entity.com_name,
            &entity.sci_name,
            &entity.family_com_name,
        ] {
            for token in tokenize(name) {
                if token.chars().count() > 1 && !TOKENS_TO_DROP.contains(&token.as_str()) {
                    vocabulary.insert(token);
                }
            }
        }
    }

    let mut common_names: AHashSet<String> = AHashSet::new();
    let mut scientific_names: AHashSet<String> = AHashSet::new();
    for entity in taxonomy.entities() {
        if !entity.com_name.is_empty() {
            common_names.insert(entity.com_name.to_lowercase());
        }
        if !entity.sci_name.is_empty() {
            scientific_names.insert(entity.sci_name.to_lowercase());
        }
    }

    let mut vocabulary: Vec<String> = vocabulary.into_iter().collect();
    vocabulary.sort();
    let mut common_names: Vec<String> = common_names.into_iter().collect();
    common_names.sort();
    let mut scientific_names: Vec<String> = scientific_names.into_iter().collect();
    scientific_names.sort();

    tracing::info!(
        "Built entity patterns: {} phrases, {} vocabulary tokens",
        patterns.len(),
        vocabulary.len()
    );

    PatternArtifacts {
        patterns,
        vocabulary,
        common_names,
        scientific_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::{Category, TaxonEntity, Taxonomy};

    fn make(com_name: &str, sci_name: &str, code: &str, category: Category) -> TaxonEntity {
        TaxonEntity {
            com_name: com_name.to_string(),
            sci_name: sci_name.to_string(),
            species_code: code.to_string(),
            category,
            taxon_order: 1,
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

    fn sample_matcher() -> (Taxonomy, TokenMatcher) {
        let taxonomy = Taxonomy::from_entities(vec![
            make("Tundra Swan", "Cygnus columbianus", "tunswa", Category::Species),
            make("Bufflehead", "Bucephala albeola", "buffle", Category::Species),
            make(
                "Tundra Swan (Bewick's)",
                "Cygnus columbianus bewickii",
                "tunswa1",
                Category::Issf,
            ),
            make("swan sp.", "Cygnus sp.", "swan1", Category::Spuh),
        ])
        .unwrap();
        let config = PipelineConfig::default();
        let matcher = TokenMatcher::new(&taxonomy, &config, None).unwrap();
        (taxonomy, matcher)
    }

    #[test]
    fn test_tokenize_strips_punctuation_keeps_apostrophes() {
        assert_eq!(
            tokenize("Tundra Swan (Bewick's)"),
            vec!["tundra", "swan", "bewick's"]
        );
        assert_eq!(tokenize("swan sp."), vec!["swan", "sp"]);
        assert_eq!(tokenize("Glaucous-winged Gull"), vec!["glaucous-winged", "gull"]);
    }

    #[test]
    fn test_vocabulary_drops_short_and_noise_tokens() {
        let (_taxonomy, matcher) = sample_matcher();
        assert!(matcher.vocabulary.contains("tundra"));
        assert!(matcher.vocabulary.contains("bufflehead"));
        // 'sp' is on the drop list
        assert!(!matcher.vocabulary.contains("sp"));
    }

    #[test]
    fn test_filter_to_possibles_keeps_species_lines() {
        let (_taxonomy, matcher) = sample_matcher();
        let lines = vec![
            "tundra swan seen at dawn".to_string(),
            "meeting notes from the committee".to_string(),
            "".to_string(),
        ];
        let possibles = matcher.filter_to_possibles(&lines);
        assert!(possibles.contains("tundra swan seen at dawn"));
        assert!(!possibles.contains("meeting notes from the committee"));
        assert_eq!(possibles.len(), 1);
    }

    #[test]
    fn test_filter_to_possibles_threshold_is_strict() {
        let taxonomy = Taxonomy::from_entities(vec![make(
            "alpha bravo charlie delta echo foxtrot golf",
            "",
            "x1",
            Category::Species,
        )])
        .unwrap();
        let config = PipelineConfig::default();
        let matcher = TokenMatcher::new(&taxonomy, &config, None).unwrap();

        let junk: Vec<String> = (0..43).map(|i| format!("junkword{:02}", i)).collect();

        // 7 known tokens out of 50: fraction exactly 0.14, excluded
        let at_threshold = format!(
            "alpha bravo charlie delta echo foxtrot golf {}",
            junk.join(" ")
        );
        // 7 known tokens out of 49: fraction above 0.14, included
        let above_threshold = format!(
            "alpha bravo charlie delta echo foxtrot golf {}",
            junk[..42].join(" ")
        );

        let possibles = matcher.filter_to_possibles(&[at_threshold.clone()]);
        assert!(possibles.is_empty());

        let possibles = matcher.filter_to_possibles(&[above_threshold.clone()]);
        assert!(possibles.contains(&above_threshold));
    }

    #[test]
    fn test_fuzzy_phrase_match_catches_ocr_misspelling() {
        let (_taxonomy, matcher) = sample_matcher();
        let phrases = vec!["bufflehead".to_string()];
        let matches = matcher.fuzzy_phrase_match(&phrases, "saw one buflehead today");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_text, "buflehead");
        assert!(matches[0].similarity > 85.0);
    }

    #[test]
    fn test_fuzzy_phrase_match_respects_boundary_punctuation() {
        let (_taxonomy, matcher) = sample_matcher();
        let phrases = vec!["tundra swan".to_string()];
        // The comma splits "tundra" and "swan" into separate phrases
        let matches = matcher.fuzzy_phrase_match(&phrases, "tundra, swan");
        assert!(matches.is_empty());
    }

    #[test]
    fn test_fuzzy_phrase_match_empty_on_no_hits() {
        let (_taxonomy, matcher) = sample_matcher();
        let matches =
            matcher.fuzzy_phrase_match(&["bufflehead".to_string()], "committee meeting notes");
        assert!(matches.is_empty());
    }

    #[test]
    fn test_tag_entities_exact_span() {
        let (_taxonomy, matcher) = sample_matcher();
        let spans = matcher.tag_entities("a tundra swan on the lake", false);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "tundra swan");
        assert_eq!(spans[0].label, "COMSPECIES");
        assert_eq!(spans[0].kind, MatchKind::Exact);
    }

    #[test]
    fn test_tag_entities_longer_span_wins() {
        let (_taxonomy, matcher) = sample_matcher();
        let spans = matcher.tag_entities("tundra swan (bewick's)", false);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].label, "COMISSF");
        assert_eq!(spans[0].text, "tundra swan bewick's");
    }

    #[test]
    fn test_tag_entities_fuzzy_fallback() {
        let (_taxonomy, matcher) = sample_matcher();
        let spans = matcher.tag_entities("one buflehead diving", true);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].label, FUZZY_COMMON_LABEL);
        assert_eq!(spans[0].kind, MatchKind::Fuzzy);
    }

    #[test]
    fn test_tag_entities_exact_beats_fuzzy() {
        let (_taxonomy, matcher) = sample_matcher();
        let spans = matcher.tag_entities("bufflehead", true);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, MatchKind::Exact);
        assert_eq!(spans[0].label, "COMSPECIES");
    }

    #[test]
    fn test_tag_entities_empty_input() {
        let (_taxonomy, matcher) = sample_matcher();
        assert!(matcher.tag_entities("", false).is_empty());
        assert!(matcher.tag_entities("... --- ...", false).is_empty());
    }

    #[test]
    fn test_categorize_lines_reports_translation_and_class() {
        use crate::translation::{RuleSource, TranslationRule};

        let (_taxonomy, matcher) = sample_matcher();
        let ctx = TranslationContext::from_rules(vec![TranslationRule {
            pattern: "whistling swan".to_string(),
            replacement: "tundra swan".to_string(),
            match_whole_line: true,
            is_regex: false,
            source: RuleSource::SystemDefault,
        }]);

        let lines = vec!["Whistling Swan".to_string(), "meeting notes".to_string()];
        let categorized = matcher.categorize_lines(&lines, &ctx);
        assert_eq!(categorized.len(), 2);

        let swan = categorized
            .iter()
            .find(|c| c.line == "whistling swan")
            .unwrap();
        assert_eq!(swan.translation, "tundra swan");
        assert!(swan.translated);
        assert_eq!(swan.category, "COMSPECIES");

        let noise = categorized.iter().find(|c| c.line == "meeting notes").unwrap();
        assert!(!noise.translated);
        assert_eq!(noise.category, "");
    }
}
