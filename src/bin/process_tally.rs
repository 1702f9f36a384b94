// Tally sheet driver
//
// Purpose: normalize one extracted tally sheet (text lines or CSV table)
// into a deduplicated (CommonName, Total) checklist.
// Usage: cargo run --bin process_tally -- <taxonomy.csv> <input> <output.csv>
//        [--ioc FILE] [--nacc FILE] [--system-translations FILE]
//        [--local-translations FILE] [--exceptions FILE] [--rarities FILE]
//        [--config FILE] [--cache-dir DIR]

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use polars::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checklist_normalizer_rust::checklist::{extract_records, ChecklistAssembler, RawRecord};
use checklist_normalizer_rust::config::PipelineConfig;
use checklist_normalizer_rust::overlays::{load_rarities, mark_rarities, Exceptions};
use checklist_normalizer_rust::taxonomy::{Taxonomy, TaxonomySources};
use checklist_normalizer_rust::token_matcher::TokenMatcher;
use checklist_normalizer_rust::translation::TranslationContext;

struct Args {
    taxonomy: PathBuf,
    input: PathBuf,
    output: PathBuf,
    ioc: Option<PathBuf>,
    nacc: Option<PathBuf>,
    system_translations: Option<PathBuf>,
    local_translations: Option<PathBuf>,
    exceptions: Option<PathBuf>,
    rarities: Option<PathBuf>,
    config: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "Usage: process_tally <taxonomy.csv> <input> <output.csv>\n\
         \u{20}       [--ioc FILE] [--nacc FILE]\n\
         \u{20}       [--system-translations FILE] [--local-translations FILE]\n\
         \u{20}       [--exceptions FILE] [--rarities FILE]\n\
         \u{20}       [--config FILE] [--cache-dir DIR]"
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut positional: Vec<PathBuf> = Vec::new();
    let mut args = Args {
        taxonomy: PathBuf::new(),
        input: PathBuf::new(),
        output: PathBuf::new(),
        ioc: None,
        nacc: None,
        system_translations: None,
        local_translations: None,
        exceptions: None,
        rarities: None,
        config: None,
        cache_dir: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut flag = |target: &mut Option<PathBuf>| match iter.next() {
            Some(value) => *target = Some(PathBuf::from(value)),
            None => usage(),
        };
        match arg.as_str() {
            "--ioc" => flag(&mut args.ioc),
            "--nacc" => flag(&mut args.nacc),
            "--system-translations" => flag(&mut args.system_translations),
            "--local-translations" => flag(&mut args.local_translations),
            "--exceptions" => flag(&mut args.exceptions),
            "--rarities" => flag(&mut args.rarities),
            "--config" => flag(&mut args.config),
            "--cache-dir" => flag(&mut args.cache_dir),
            "--help" | "-h" => usage(),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    if positional.len() != 3 {
        usage();
    }
    args.output = positional.pop().unwrap();
    args.input = positional.pop().unwrap();
    args.taxonomy = positional.pop().unwrap();
    args
}

fn read_input_records(args: &Args) -> anyhow::Result<Vec<RawRecord>> {
    let is_csv = args
        .input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(args.input.clone()))?
            .finish()?;
        return extract_records(&df);
    }

    // Plain text: unique lines, no per-line totals
    let contents = fs::read_to_string(&args.input)?;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    lines.sort();
    lines.dedup();
    Ok(lines.iter().map(|l| RawRecord::new(l, "")).collect())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checklist_normalizer_rust=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args();
    let start = Instant::now();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    println!("Loading taxonomy: {:?}", args.taxonomy);
    let sources = TaxonomySources {
        primary: args.taxonomy.clone(),
        ioc: args.ioc.clone(),
        nacc: args.nacc.clone(),
    };
    let taxonomy = Taxonomy::load(&sources, args.cache_dir.as_deref())?;
    println!("  {} taxonomy records", taxonomy.len());

    let translations = TranslationContext::load(
        args.system_translations.as_deref(),
        args.local_translations.as_deref(),
    )?;
    println!("  {} translation rules", translations.len());

    let matcher = TokenMatcher::new(&taxonomy, &config, args.cache_dir.as_deref())?;

    let records = read_input_records(&args)?;
    println!("  {} input records", records.len());

    let lines: Vec<String> = records.iter().map(|r| r.name.to_lowercase()).collect();
    let possibles = matcher.filter_to_possibles(&lines);
    println!(
        "Possible species lines: {} (based on word intersections)",
        possibles.len()
    );

    let assembler = ChecklistAssembler::new(&taxonomy, &translations, &config);
    let mut result = assembler.assemble(&records);

    if let Some(path) = &args.exceptions {
        let exceptions = Exceptions::load(path)?;
        if !exceptions.is_empty() {
            let names: Vec<String> =
                result.rows.iter().map(|r| r.common_name.clone()).collect();
            let kept = exceptions.apply(&names);
            result
                .rows
                .retain(|row| kept.iter().any(|n| n.eq_ignore_ascii_case(&row.common_name)));
        }
    }

    if let Some(path) = &args.rarities {
        let rare = load_rarities(path)?;
        mark_rarities(&mut result.rows, &rare);
    }

    if !result.unresolved.is_empty() {
        println!("No translation found for:");
        for name in &result.unresolved {
            println!("  {}", name);
        }
    }

    // Write the normalized checklist
    let names: Vec<&str> = result.rows.iter().map(|r| r.common_name.as_str()).collect();
    let totals: Vec<i64> = result.rows.iter().map(|r| r.total).collect();
    let rare: Vec<&str> = result
        .rows
        .iter()
        .map(|r| if r.rare { "X" } else { "" })
        .collect();
    let uncounted: Vec<&str> = result
        .rows
        .iter()
        .map(|r| if r.uncounted { "X" } else { "" })
        .collect();
    let taxon_orders: Vec<i64> = result.rows.iter().map(|r| r.taxon_order).collect();

    let mut out_df = df![
        "CommonName" => names,
        "Total" => totals,
        "Rare" => rare,
        "Uncounted" => uncounted,
        "TaxonOrder" => taxon_orders,
    ]?;
    let out_file = fs::File::create(&args.output)?;
    CsvWriter::new(out_file).finish(&mut out_df)?;
    println!("Wrote {} rows: {:?}", out_df.height(), args.output);

    // Categorized-lines review report next to the checklist
    let categorized = matcher.categorize_lines(&lines, &translations);
    let review_path = args.output.with_extension("categorized.csv");
    let mut review_df = df![
        "Line" => categorized.iter().map(|c| c.line.as_str()).collect::<Vec<_>>(),
        "Translation" => categorized.iter().map(|c| c.translation.as_str()).collect::<Vec<_>>(),
        "Translated" => categorized.iter().map(|c| c.translated).collect::<Vec<_>>(),
        "Category" => categorized.iter().map(|c| c.category.as_str()).collect::<Vec<_>>(),
    ]?;
    let review_file = fs::File::create(&review_path)?;
    CsvWriter::new(review_file).finish(&mut review_df)?;
    println!("Wrote review report: {:?}", review_path);

    println!("Done in {:.2?}", start.elapsed());
    Ok(())
}
