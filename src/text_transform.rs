//! Text Normalizer
//!
//! Staged, pure string transforms that strip OCR/encoding noise from
//! scanned tally-sheet lines without attempting taxonomic resolution.
//! Stage order matters and is preserved exactly:
//!
//! 1. `pre_process_line` - encoding/OCR artifact repair
//! 2. `secondary_species_processing` - structural punctuation noise
//! 3. `tertiary_transformation` - word-order repair ("Gull, Glaucous-winged")
//!
//! Every transform is a total function over strings; worst case it returns
//! an empty string. Running any stage twice produces the same output as
//! running it once.

use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::taxonomy::Taxonomy;
use crate::translation::TranslationContext;

lazy_static! {
    // Sloppy on purpose: any digits/digits/digits run reads as a date here
    static ref DATE_RE: Regex = Regex::new(r"[0-9]+/[0-9]+/[0-9]+").unwrap();
    static ref ALL_NUMERIC_LINE_RE: Regex = Regex::new(r"^[0-9\s\._]+$").unwrap();
    static ref LEADING_COUNT_RE: Regex = Regex::new(r"^\s*[0-9]+\s*").unwrap();
    static ref DIGITS_RE: Regex = Regex::new(r"[0-9]+").unwrap();
    static ref LEADING_DOTS_RE: Regex = Regex::new(r"^[\.\s]+").unwrap();

    static ref WRAPPED_IN_PARENS_RE: Regex = Regex::new(r"^\(([^\)]+)\)\s*$").unwrap();
    static ref LEADING_JUNK_RE: Regex = Regex::new(r"^[\(\*#_\.\+\s=-]+").unwrap();
    static ref TRAILING_JUNK_RE: Regex = Regex::new(r"[/\*#_\s\+-]+$").unwrap();
    static ref COMMA_SP_RE: Regex = Regex::new(r",\s*sp\.?$").unwrap();
    static ref TRAILING_DOTS_RE: Regex = Regex::new(r"[\.\s-]+$").unwrap();
    static ref SHORT_TRAILING_PAREN_RE: Regex = Regex::new(r"\([^\)]{0,2}\)$").unwrap();
    static ref HAS_TEXT_BEFORE_PAREN_RE: Regex = Regex::new(r"[^\(]\([^\)]{0,2}\)$").unwrap();

    static ref MID_PARENTHETICAL_RE: Regex =
        Regex::new(r"([^\(]+)(\([^\)]+\))\s+([^\(]+)").unwrap();
    static ref WRAPPED_SPUH_RE: Regex = Regex::new(r"\((.* sp\.)\)").unwrap();
    static ref LEADING_NON_ALPHA_RE: Regex = Regex::new(r"^[^A-Za-z]+").unwrap();
    static ref MULTI_SPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// Straighten curly quotes so the later ASCII filter keeps apostrophes in
/// names like "Bewick's Wren" instead of dropping them.
fn uncurl_quotes(line: &str) -> String {
    line.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' => '"',
            other => other,
        })
        .collect()
}

/// First-stage cleanup of a raw extracted line.
///
/// Only repairs text-level conversion artifacts; it never rearranges words
/// to match the taxonomy. NFKD runs first so ligatures like 'Buffleheed'
/// written with the U+FB04 ligature decompose before the ASCII filter.
///
/// Counts and dates are dropped, and then all remaining digits: the couple
/// of real names containing digits ("Evening Grosbeak (type 1)") survive
/// downstream fuzzy matching regardless.
pub fn pre_process_line(line: &str) -> String {
    if line.is_empty() {
        return String::new();
    }

    // Compatibility decomposition flattens ligatures and diacritic variants
    let mut line: String = line.nfkd().collect();

    // Drop underlines
    line = line.replace('_', "");

    // '=' makes Excel treat the cell as a formula
    line = line.replace('=', " ");

    // Fix soft hyphens
    line = line.replace('\u{ad}', "-");

    // Detab
    line = line.replace('\t', " ");

    line = DATE_RE.replace_all(&line, "").into_owned();

    // If the line is all numbers, drop it entirely
    line = ALL_NUMERIC_LINE_RE.replace(&line, "").into_owned();

    // Leading tally counts, e.g. "8588 Bufflehead"
    line = LEADING_COUNT_RE.replace(&line, "").into_owned();

    line = DIGITS_RE.replace_all(&line, "").into_owned();

    // Leading spaces and periods
    line = LEADING_DOTS_RE.replace(&line, "").into_owned();

    line = uncurl_quotes(&line);

    // Drop the stray "box" glyphs some converters emit, e.g. '\u{f06f} Winter Wren'.
    // Heavy handed (accented characters are lost), so it comes last.
    line.retain(|c| c.is_ascii());

    line.trim().to_string()
}

const ALLOWED_PUNCTUATION: &str = "()/-'.,";

/// Second-stage cleanup of a line that may be a species.
pub fn secondary_species_processing(line: &str) -> String {
    let mut line = line.to_string();

    // If the whole line looks like "(accipiter sp.)", drop the parens
    if let Some(caps) = WRAPPED_IN_PARENS_RE.captures(&line) {
        line = caps[1].to_string();
    }

    line = LEADING_JUNK_RE.replace(&line, "").into_owned();

    // Keep parens, slash, dash, apostrophe, period and comma
    line = line
        .chars()
        .filter(|c| !c.is_ascii_punctuation() || ALLOWED_PUNCTUATION.contains(*c))
        .collect();
    line = line.trim().to_string();

    line = TRAILING_JUNK_RE.replace(&line, "").into_owned();

    // Some sheets write "scaup, sp"
    line = COMMA_SP_RE.replace(&line, " sp.").into_owned();

    // Careful with trailing periods: "galapagos finch sp." is legitimate,
    // "rough-legged hawk ........" is not
    if !line.ends_with("sp.") {
        line = TRAILING_DOTS_RE.replace(&line, "").into_owned();
    }

    // Cheap way to get rid of a lone trailing paren, e.g. "Brown Pelican)"
    if !line.contains('(') {
        line = line.replace(')', "");
    }

    // A short trailing parenthetical is a footnote marker, not taxonomy;
    // the shortest real (...) in the species list is 3 characters
    if HAS_TEXT_BEFORE_PAREN_RE.is_match(&line) {
        line = SHORT_TRAILING_PAREN_RE.replace(&line, "").into_owned();
    }

    line.trim().to_string()
}

/// Third-stage word-order repair.
///
/// 'Dark-eyed (slate-colored) Junco' => 'Dark-eyed Junco (slate-colored)',
/// 'Gull, Glaucous-winged' => 'Glaucous-winged Gull', and an ' x ' infix
/// gains a '(hybrid)' marker when none is present.
pub fn tertiary_transformation(line: &str) -> String {
    let mut line = MID_PARENTHETICAL_RE
        .replace_all(line, "${1} ${3} ${2}")
        .into_owned();

    // Some circles enclose their 'sp.' entries in parentheses
    line = WRAPPED_SPUH_RE.replace_all(&line, "${1}").into_owned();

    line = LEADING_NON_ALPHA_RE.replace(&line, "").into_owned();

    if line.contains(',') {
        let mut parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        parts.reverse();
        line = parts.join(" ");
    }

    if line.contains(" x ") && !line.contains("(hybrid)") {
        line.push_str(" (hybrid)");
    }

    line = MULTI_SPACE_RE.replace_all(&line, " ").into_owned();

    line.trim().to_string()
}

/// Full lexical normalization of one line: all three stages in order.
pub fn normalize_line(line: &str) -> String {
    tertiary_transformation(&secondary_species_processing(&pre_process_line(line)))
}

/// Drop a trailing two-word scientific name when it matches the taxonomy.
///
/// Some checklists print `<Common Name> <Scientific Name>`, e.g.
/// "California Quail Callipepla californica". Scientific names are assumed
/// to be the last two words.
pub fn strip_scientific_suffix(line: &str, taxonomy: &Taxonomy) -> String {
    let line = line.trim();
    let words: Vec<&str> = line.split(' ').collect();
    if words.len() > 2 {
        let sci_name = words[words.len() - 2..].join(" ").to_lowercase();
        if taxonomy.find_by_scientific_name(&sci_name).is_some() {
            return words[..words.len() - 2].join(" ");
        }
    }
    line.to_string()
}

/// `strip_scientific_suffix` over a whole line list.
pub fn strip_off_scientific_names(lines: &[String], taxonomy: &Taxonomy) -> Vec<String> {
    lines
        .iter()
        .map(|line| strip_scientific_suffix(line, taxonomy))
        .collect()
}

/// Normalize, double-translate and canonicalize a list of names.
///
/// Returns the taxonomy's capitalization for each resolvable name and an
/// empty string for each name that is not in the taxonomy.
pub fn clean_common_names(
    common_names: &[String],
    taxonomy: &Taxonomy,
    translation_context: &TranslationContext,
) -> Vec<String> {
    common_names
        .iter()
        .map(|line| {
            let cleaned = secondary_species_processing(&pre_process_line(line));
            let translated = translation_context.double_translate(&cleaned);
            if translated.is_empty() {
                return String::new();
            }
            match taxonomy.find_by_common_name(&translated) {
                Some(entity) => entity.com_name.clone(),
                None => {
                    tracing::debug!("no taxonomy entry for \"{}\"", translated);
                    String::new()
                }
            }
        })
        .collect()
}
