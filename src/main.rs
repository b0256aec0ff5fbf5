// LEI Explorer - CLI
//
//   lei-explorer match <query>
//   lei-explorer details <lei>
//   lei-explorer batch <file> [--csv]
//   lei-explorer resolve <file>
//   lei-explorer hierarchy <lei> [--csv]
//   lei-explorer analyze <lei>

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use lei_explorer::{
    is_lei, parse_entity_list, registry, write_hierarchy_csv, write_match_csv,
    write_resolution_csv, AppConfig, HierarchyLoader, HierarchyNode, LeiRegistry, LoadOutcome,
    MatchRanker, MatchResult, PostalAddress, RiskDimension,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lei_explorer=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let csv = args.iter().any(|a| a == "--csv");
    let positional: Vec<&str> = args
        .iter()
        .skip(1)
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect();

    let Some((&command, rest)) = positional.split_first() else {
        print_usage();
        return Ok(());
    };

    let config = AppConfig::load()?;
    let registry = registry::from_config(&config)?;

    match command {
        "match" => {
            let query = rest.join(" ");
            if query.trim().is_empty() {
                bail!("Usage: lei-explorer match <query>");
            }
            run_match(registry, &config, &query).await
        }
        "details" => run_details(registry, required(rest, "details <lei>")?).await,
        "batch" => run_batch(registry, &config, required(rest, "batch <file>")?, csv).await,
        "resolve" => run_resolve(registry, &config, required(rest, "resolve <file>")?).await,
        "hierarchy" => run_hierarchy(registry, &config, required(rest, "hierarchy <lei>")?, csv).await,
        "analyze" => run_analyze(registry, &config, required(rest, "analyze <lei>")?).await,
        "help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("Unknown command: {}", other)
        }
    }
}

fn required<'a>(rest: &[&'a str], usage: &str) -> Result<&'a str> {
    match rest.first() {
        Some(value) => Ok(value),
        None => bail!("Usage: lei-explorer {}", usage),
    }
}

fn print_usage() {
    println!("🔎 LEI Explorer v{}", lei_explorer::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  match <query>            Rank registry matches for one name");
    println!("  details <lei>            Full registry profile for one LEI");
    println!("  batch <file> [--csv]     Match every name in a file (lines or commas)");
    println!("  resolve <file>           Best match + ultimate parent per name (CSV)");
    println!("  hierarchy <lei> [--csv]  Load the full ownership tree");
    println!("  analyze <lei>            Structural and risk metrics for the tree");
    println!();
    println!("  LEI_FIXTURE=<json>  use an offline fixture instead of the GLEIF API");
}

fn read_queries(path: &str) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("Failed to read entity list {}", path))?;
    Ok(parse_entity_list(&text))
}

fn print_matches(result: &MatchResult) {
    println!("\n📋 {} → {} candidate(s)", result.input_entity, result.matches.len());
    for (i, m) in result.matches.iter().enumerate() {
        println!(
            "  {:>2}. {:>3}% {:<8} {}  {}  [{}{}]",
            i + 1,
            m.confidence,
            m.match_kind.as_str(),
            m.entity.lei,
            m.entity.display_name(),
            m.entity.status,
            m.entity
                .jurisdiction
                .as_deref()
                .map(|j| format!(" • {}", j))
                .unwrap_or_default(),
        );
    }
}

async fn run_match(registry: Arc<dyn LeiRegistry>, config: &AppConfig, query: &str) -> Result<()> {
    let ranker = MatchRanker::from_config(registry, config);
    let result = ranker.search_and_rank(query).await;
    if result.is_empty() {
        println!("❌ No matches for {:?}", query);
    } else {
        print_matches(&result);
    }
    Ok(())
}

fn print_address(label: &str, address: Option<&PostalAddress>) {
    let Some(address) = address else { return };
    let locality: Vec<&str> = [&address.city, &address.region, &address.postal_code, &address.country]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .collect();
    println!("{:<19}{}", label, address.address_lines.join(", "));
    if !locality.is_empty() {
        println!("{:<19}{}", "", locality.join(", "));
    }
}

async fn run_details(registry: Arc<dyn LeiRegistry>, lei: &str) -> Result<()> {
    if !is_lei(lei) {
        bail!("Invalid LEI format: {}", lei);
    }
    let Some(details) = registry.get_entity_details(lei).await? else {
        println!("❌ LEI {} not found", lei);
        return Ok(());
    };

    let show = |value: Option<&str>| value.unwrap_or("n/a").to_string();
    let date = |value: Option<chrono::NaiveDate>| {
        value
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "n/a".to_string())
    };

    println!("🪪 {} ({})", details.legal_name.as_deref().unwrap_or(&details.lei), details.lei);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Status:            {}", details.entity_status);
    println!("Jurisdiction:      {}", show(details.legal_jurisdiction.as_deref()));
    println!(
        "Category:          {}{}",
        show(details.entity_category.as_deref()),
        details
            .entity_sub_category
            .as_deref()
            .map(|sub| format!(" / {}", sub))
            .unwrap_or_default()
    );
    print_address("Legal address:", details.legal_address.as_ref());
    print_address("Headquarters:", details.headquarters_address.as_ref());
    if let Some(ra) = &details.registration_authority {
        println!(
            "Registered with:   {} (id {})",
            show(ra.authority_id.as_deref()),
            show(ra.entity_id.as_deref())
        );
    }
    println!("Created:           {}", date(details.entity_creation_date));
    println!("Last update:       {}", date(details.last_update_date));
    println!("Next renewal:      {}", date(details.next_renewal_date));
    if details.entity_expiration_date.is_some() {
        println!("Expires:           {}", date(details.entity_expiration_date));
    }
    println!("Managing LOU:      {}", show(details.managing_lou.as_deref()));
    println!("Validation:        {}", show(details.validation_sources.as_deref()));
    Ok(())
}

async fn run_batch(registry: Arc<dyn LeiRegistry>, config: &AppConfig, path: &str, csv: bool) -> Result<()> {
    let queries = read_queries(path)?;
    let ranker = MatchRanker::from_config(registry, config);
    let results = ranker.match_batch(&queries).await;

    if csv {
        write_match_csv(io::stdout().lock(), &results)?;
        return Ok(());
    }

    for result in &results {
        print_matches(result);
    }
    let matched = results.iter().filter(|r| !r.is_empty()).count();
    println!("\n✓ {} of {} inputs matched", matched, results.len());
    Ok(())
}

async fn run_resolve(registry: Arc<dyn LeiRegistry>, config: &AppConfig, path: &str) -> Result<()> {
    let queries = read_queries(path)?;
    let ranker = MatchRanker::from_config(registry, config);
    let rows = ranker.resolve_entities(&queries).await;
    write_resolution_csv(io::stdout().lock(), &rows)
}

async fn load_tree(registry: Arc<dyn LeiRegistry>, config: &AppConfig, lei: &str) -> Result<(HierarchyLoader, HierarchyNode)> {
    if !is_lei(lei) {
        bail!("Invalid LEI format: {}", lei);
    }

    let loader = HierarchyLoader::from_config(registry, config);
    match loader.load_hierarchy(lei).await {
        LoadOutcome::NoData => bail!("No hierarchy data for {}", lei),
        LoadOutcome::Superseded => bail!("Hierarchy load for {} was superseded", lei),
        LoadOutcome::Loaded { .. } => {}
    }
    loader.wait_for_background().await;

    let tree = loader
        .snapshot()
        .context("Hierarchy disappeared after loading")?;
    Ok((loader, tree))
}

async fn run_hierarchy(registry: Arc<dyn LeiRegistry>, config: &AppConfig, lei: &str, csv: bool) -> Result<()> {
    let (_, tree) = load_tree(registry, config, lei).await?;

    if csv {
        return write_hierarchy_csv(io::stdout().lock(), &tree);
    }

    println!("🌳 Ultimate parent: {} ({})", tree.entity.display_name(), tree.lei());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (depth, _, node) in tree.flatten() {
        let marker = if node.is_fetched() { "" } else { "  (children not loaded)" };
        println!(
            "{}{} {} [{}]{}",
            "  ".repeat(depth),
            node.lei(),
            node.entity.display_name(),
            node.entity.status,
            marker
        );
    }
    println!("\n✓ {} entities", tree.node_count());
    Ok(())
}

async fn run_analyze(registry: Arc<dyn LeiRegistry>, config: &AppConfig, lei: &str) -> Result<()> {
    let (loader, _) = load_tree(registry, config, lei).await?;
    let shape = loader.refresh_shape().await;
    let analysis = loader.analyze().context("Nothing to analyze")?;

    println!("📊 Hierarchy analysis for {}", lei);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Entities:          {}", analysis.total);
    println!("Max depth:         {}", analysis.max_depth);
    println!("Countries:         {} (HHI {}, top {}%)", analysis.num_countries, analysis.hhi, analysis.top_country_share);
    println!("Avg children:      {} (p75 {}, max fan-out {})", analysis.avg_children, analysis.p75_children, analysis.max_fan_out);
    println!("Non-active:        {}%", analysis.non_active_pct);
    println!(
        "Missing data:      country {}% • name {}% • last update {}%",
        analysis.missing_country_pct, analysis.missing_name_pct, analysis.missing_update_pct
    );
    match analysis.median_staleness {
        Some(days) => println!("Median staleness:  {} days", days),
        None => println!("Median staleness:  n/a"),
    }
    println!("Complexity score:  {}/100", analysis.complexity_score);

    if let Some(shape) = shape {
        println!(
            "Registry totals:   depth {} • descendants {} • ultimate children {}",
            shape.max_depth, shape.descendants_count, shape.ultimate_children_count
        );
    }

    let by_depth: BTreeMap<usize, usize> = analysis.depth_counts.clone();
    println!("\nBy depth:");
    for (depth, count) in by_depth {
        println!("  {:>2}: {}", depth, count);
    }

    println!("\nTop countries:");
    for country in analysis.countries.iter().take(10) {
        println!("  {} {:<30} {}", country.code, country.name, country.count);
    }

    println!("\nRisks:");
    for dimension in [
        RiskDimension::Concentration,
        RiskDimension::Depth,
        RiskDimension::Opacity,
        RiskDimension::Staleness,
        RiskDimension::Status,
        RiskDimension::FanOut,
    ] {
        println!("  {:<28} {}", dimension.label(), analysis.risk(dimension).as_str());
    }
    Ok(())
}
