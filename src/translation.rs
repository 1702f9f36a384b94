//! Translation Context
//!
//! A prioritized, overridable rule table mapping locally-spelled or aliased
//! species names to taxonomy-recognized strings. Rules come from two
//! layered CSV tables: system defaults, then local overrides; a local rule
//! with the same pattern key supersedes the system one.
//!
//! Rules are an explicit ordered list of tagged variants (whole-line,
//! regex, literal) evaluated by a single interpreter. Once a whole-line
//! rule matches exactly, scanning stops: an authoritative exact match must
//! not be rewritten further by a lower-priority rule. That short-circuit is
//! a tested contract, not an incidental loop break.

use anyhow::{Context, Result};
use polars::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Which table a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    SystemDefault,
    LocalOverride,
}

/// One row of a translation table, before compilation.
#[derive(Debug, Clone)]
pub struct TranslationRule {
    pub pattern: String,
    pub replacement: String,
    pub match_whole_line: bool,
    pub is_regex: bool,
    pub source: RuleSource,
}

enum RuleKind {
    /// Whole-line exact match: pattern compiled as `^escaped$`.
    WholeLine(Regex),
    /// Substring regex substitution.
    Regex(Regex),
    /// Literal substring replacement.
    Literal,
}

struct CompiledRule {
    pattern: String,
    replacement: String,
    kind: RuleKind,
}

/// Layered system + local translation rules.
///
/// Read-only after construction; safe to share across parallel workers.
pub struct TranslationContext {
    rules: Vec<CompiledRule>,
    system_path: Option<PathBuf>,
    local_path: Option<PathBuf>,
}

/// Spreadsheet exports carry non-breaking spaces; patterns and
/// replacements are compared lowercase.
fn fix_excel_changes(value: &str) -> String {
    value.replace('\u{a0}', " ").to_lowercase()
}

impl TranslationContext {
    /// Load and layer the system and local translation tables.
    ///
    /// Either path may be absent; an empty context translates nothing.
    pub fn load(system_path: Option<&Path>, local_path: Option<&Path>) -> Result<Self> {
        let mut context = TranslationContext {
            rules: Vec::new(),
            system_path: system_path.map(Path::to_path_buf),
            local_path: local_path.map(Path::to_path_buf),
        };
        context.initialize()?;
        Ok(context)
    }

    /// Build a context from in-memory rules (tests, programmatic tables).
    pub fn from_rules(rules: Vec<TranslationRule>) -> Self {
        let mut context = TranslationContext {
            rules: Vec::new(),
            system_path: None,
            local_path: None,
        };
        context.install(rules);
        context
    }

    /// Re-read the rule tables; for debugging a translation table while a
    /// run is in progress. Warns about whole-line patterns with trailing
    /// whitespace, which can never match a trimmed line.
    pub fn reload(&mut self) -> Result<()> {
        self.initialize()?;
        for rule in &self.rules {
            if matches!(rule.kind, RuleKind::WholeLine(_)) && rule.pattern.ends_with(' ') {
                tracing::warn!("Pattern \"{}\" has trailing whitespace", rule.pattern);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn initialize(&mut self) -> Result<()> {
        let mut rules = Vec::new();
        if let Some(path) = self.system_path.clone() {
            rules.extend(read_translation_table(&path, RuleSource::SystemDefault)?);
        }
        if let Some(path) = self.local_path.clone() {
            rules.extend(read_translation_table(&path, RuleSource::LocalOverride)?);
        }
        self.install(rules);
        Ok(())
    }

    fn install(&mut self, rules: Vec<TranslationRule>) {
        // Local overrides come after system rules; keep the last rule for
        // each pattern key, at its later position
        let mut deduped: Vec<TranslationRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = fix_excel_changes(&rule.pattern);
            deduped.retain(|r| fix_excel_changes(&r.pattern) != pattern);
            deduped.push(rule);
        }

        // Whole-line rules apply first; sort is stable so table order is
        // otherwise preserved
        deduped.sort_by_key(|rule| if rule.match_whole_line { 0 } else { 1 });

        self.rules.clear();
        for rule in deduped {
            let pattern = fix_excel_changes(&rule.pattern);
            let replacement = fix_excel_changes(&rule.replacement);

            let kind = if rule.match_whole_line {
                match Regex::new(&format!("^{}$", regex::escape(&pattern))) {
                    Ok(re) => RuleKind::WholeLine(re),
                    Err(err) => {
                        tracing::warn!(
                            "Translation compile regex fail: \"{}\" ({})",
                            pattern,
                            err
                        );
                        continue;
                    }
                }
            } else if rule.is_regex {
                match Regex::new(&pattern) {
                    Ok(re) => RuleKind::Regex(re),
                    Err(err) => {
                        // A malformed rule is inert, never fatal
                        tracing::warn!(
                            "Translation compile regex fail: \"{}\" ({})",
                            pattern,
                            err
                        );
                        continue;
                    }
                }
            } else {
                RuleKind::Literal
            };

            self.rules.push(CompiledRule {
                pattern,
                replacement,
                kind,
            });
        }
    }

    /// Apply the rule table to one line.
    ///
    /// The input is case-folded to lowercase before matching. Returns the
    /// rewritten line and whether a whole-line rule matched exactly (which
    /// stops further scanning).
    pub fn apply_translations(&self, line: &str) -> (String, bool) {
        let mut line = line.to_lowercase();
        let mut found_exact_match = false;

        for rule in &self.rules {
            match &rule.kind {
                RuleKind::Literal => {
                    line = line.replace(&rule.pattern, &rule.replacement);
                }
                RuleKind::WholeLine(re) => {
                    if re.is_match(&line) {
                        found_exact_match = true;
                    }
                    line = re.replace_all(&line, rule.replacement.as_str()).into_owned();
                }
                RuleKind::Regex(re) => {
                    line = re.replace_all(&line, rule.replacement.as_str()).into_owned();
                }
            }

            if found_exact_match {
                break;
            }
        }

        (line.trim().to_string(), found_exact_match)
    }

    /// Two full passes. One pass does not reliably reach a fixed point when
    /// a rule's output itself matches another rule's pattern; for any
    /// well-formed table (no 2-cycles) a third pass changes nothing.
    pub fn double_translate(&self, line: &str) -> String {
        let (first, _) = self.apply_translations(line);
        let (second, _) = self.apply_translations(&first);
        second
    }
}

fn read_bool_column(df: &DataFrame, name: &str) -> Result<Vec<bool>> {
    let has = df.get_column_names().iter().any(|c| c.as_str() == name);
    if !has {
        return Ok(vec![false; df.height()]);
    }
    let col = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?;

    // Spreadsheet exports write booleans as TRUE/FALSE, 1/0 or X marks
    if let Ok(ca) = col.bool() {
        return Ok(ca.into_iter().map(|opt| opt.unwrap_or(false)).collect());
    }
    let col = col
        .cast(&DataType::String)
        .with_context(|| format!("Column '{}' not castable", name))?;
    let ca = col.str()?;
    Ok(ca
        .into_iter()
        .map(|opt| {
            matches!(
                opt.unwrap_or("").trim().to_lowercase().as_str(),
                "true" | "1" | "x" | "yes"
            )
        })
        .collect())
}

fn read_string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
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
        .map(|opt| opt.unwrap_or("").to_string())
        .collect())
}

fn read_translation_table(path: &Path, source: RuleSource) -> Result<Vec<TranslationRule>> {
    if !path.is_file() {
        // The local table often does not exist yet for a new circle
        tracing::info!("Translation table not found, skipping: {:?}", path);
        return Ok(Vec::new());
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.into()))
        .with_context(|| format!("Failed to create CSV reader: {:?}", path))?
        .finish()
        .with_context(|| format!("Failed to load translation table: {:?}", path))?;

    let patterns = read_string_column(&df, "LocalSpeciesName")?;
    let replacements = read_string_column(&df, "eBirdSpeciesName")?;
    let whole_line = read_bool_column(&df, "match_whole_line")?;
    let is_regex = read_bool_column(&df, "regex")?;

    let mut rules = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        if patterns[idx].trim().is_empty() {
            continue;
        }
        rules.push(TranslationRule {
            pattern: patterns[idx].clone(),
            replacement: replacements[idx].clone(),
            match_whole_line: whole_line[idx],
            is_regex: is_regex[idx],
            source,
        });
    }

    tracing::info!("Loaded {} translation rules from {:?}", rules.len(), path);
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn literal(pattern: &str, replacement: &str) -> TranslationRule {
        TranslationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            match_whole_line: false,
            is_regex: false,
            source: RuleSource::SystemDefault,
        }
    }

    fn whole_line(pattern: &str, replacement: &str) -> TranslationRule {
        TranslationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            match_whole_line: true,
            is_regex: false,
            source: RuleSource::SystemDefault,
        }
    }

    fn regex_rule(pattern: &str, replacement: &str) -> TranslationRule {
        TranslationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            match_whole_line: false,
            is_regex: true,
            source: RuleSource::SystemDefault,
        }
    }

    #[test]
    fn test_literal_substring_replacement() {
        let ctx = TranslationContext::from_rules(vec![literal("g-w teal", "green-winged teal")]);
        let (line, exact) = ctx.apply_translations("G-W Teal (male)");
        assert_eq!(line, "green-winged teal (male)");
        assert!(!exact);
    }

    #[test]
    fn test_whole_line_exact_match_short_circuits() {
        let ctx = TranslationContext::from_rules(vec![
            whole_line("canada jay", "gray jay"),
            // Would rewrite the output of the first rule if scanning continued
            literal("gray", "grey"),
        ]);
        let (line, exact) = ctx.apply_translations("Canada Jay");
        assert_eq!(line, "gray jay");
        assert!(exact);
    }

    #[test]
    fn test_whole_line_rules_apply_before_substring_rules() {
        // Table order puts the literal first; the stable sort must still
        // run the whole-line rule first
        let ctx = TranslationContext::from_rules(vec![
            literal("sparrow", "finch"),
            whole_line("house sparrow", "house sparrow"),
        ]);
        let (line, exact) = ctx.apply_translations("House Sparrow");
        assert_eq!(line, "house sparrow");
        assert!(exact);
    }

    #[test]
    fn test_regex_rule_substitution() {
        let ctx = TranslationContext::from_rules(vec![regex_rule(
            r"accip\w* sp\.?",
            "accipiter sp.",
        )]);
        let (line, _) = ctx.apply_translations("accips sp");
        assert_eq!(line, "accipiter sp.");
    }

    #[test]
    fn test_malformed_regex_is_inert() {
        let ctx = TranslationContext::from_rules(vec![
            regex_rule(r"[unclosed", "nothing"),
            literal("mallard", "mallard"),
        ]);
        let (line, _) = ctx.apply_translations("a [unclosed mallard");
        assert_eq!(line, "a [unclosed mallard");
    }

    #[test]
    fn test_local_override_wins_on_same_pattern() {
        let mut system = whole_line("sea gull", "herring gull");
        system.source = RuleSource::SystemDefault;
        let mut local = whole_line("sea gull", "glaucous-winged gull");
        local.source = RuleSource::LocalOverride;

        let ctx = TranslationContext::from_rules(vec![system, local]);
        let (line, exact) = ctx.apply_translations("Sea Gull");
        assert_eq!(line, "glaucous-winged gull");
        assert!(exact);
    }

    #[test]
    fn test_double_translate_reaches_fixed_point() {
        // First rule's output matches the second rule's pattern: one pass is
        // not enough, two are, and a third changes nothing
        let ctx = TranslationContext::from_rules(vec![
            literal("speckled grebe", "spotted grebe"),
            literal("spotted grebe", "pied-billed grebe"),
        ]);
        let (one, _) = ctx.apply_translations("Speckled Grebe");
        assert_eq!(one, "pied-billed grebe");

        let two = ctx.double_translate("Speckled Grebe");
        assert_eq!(two, "pied-billed grebe");

        let three = ctx.double_translate(&two);
        assert_eq!(three, two);
    }

    #[test]
    fn test_nonbreaking_space_repair() {
        let ctx =
            TranslationContext::from_rules(vec![whole_line("canada\u{a0}goose", "canada goose")]);
        let (line, exact) = ctx.apply_translations("canada goose");
        assert_eq!(line, "canada goose");
        assert!(exact);
    }

    #[test]
    fn test_load_layers_system_and_local_tables() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("SystemTranslations.csv");
        let local = dir.path().join("LocalTranslations.csv");
        fs::write(
            &system,
            "LocalSpeciesName,eBirdSpeciesName,match_whole_line,regex\n\
             sea gull,herring gull,true,false\n\
             g-w teal,green-winged teal,false,false\n",
        )
        .unwrap();
        fs::write(
            &local,
            "LocalSpeciesName,eBirdSpeciesName,match_whole_line,regex\n\
             sea gull,glaucous-winged gull,true,false\n",
        )
        .unwrap();

        let mut ctx =
            TranslationContext::load(Some(system.as_path()), Some(local.as_path())).unwrap();
        assert_eq!(ctx.len(), 2);

        let (line, exact) = ctx.apply_translations("sea gull");
        assert_eq!(line, "glaucous-winged gull");
        assert!(exact);

        ctx.reload().unwrap();
        let (line, _) = ctx.apply_translations("g-w teal");
        assert_eq!(line, "green-winged teal");
    }

    #[test]
    fn test_missing_table_is_empty_not_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = TranslationContext::load(
            Some(dir.path().join("nope.csv").as_path()),
            None,
        )
        .unwrap();
        assert!(ctx.is_empty());
        let (line, exact) = ctx.apply_translations("Bufflehead");
        assert_eq!(line, "bufflehead");
        assert!(!exact);
    }
}
