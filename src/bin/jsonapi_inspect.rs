use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use productive_sync::catalog;
use productive_sync::config;
use productive_sync::jsonapi::model::{Document, PrimaryData};
use productive_sync::jsonapi::{ApiClient, JsonApiSource, PageRequest};
use productive_sync::resolve::IncludedIndex;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Resource kind to inspect
    #[arg(long)]
    kind: String,

    /// Override the kind's include spec
    #[arg(long)]
    include: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let spec = catalog::find(&args.kind).ok_or_else(|| anyhow!("unknown kind: {}", args.kind))?;
    let client = ApiClient::from_config(&cfg)?;

    let fetch = spec.fetch_spec(&cfg.sync);
    let include = args.include.or(fetch.include.clone());
    let mut request = PageRequest::new(&fetch.path, 1, fetch.page_size);
    request.sort = fetch.sort.clone();
    request.include = include.clone();
    request.filters = fetch.filters.clone();

    let body = client.get_page(&request).await?;
    let (primary, included) = match serde_json::from_value::<Document>(body) {
        Ok(doc) => match doc.data {
            PrimaryData::Many(items) => (Some(items.len()), doc.included),
            PrimaryData::One(_) => (None, doc.included),
        },
        Err(err) => {
            eprintln!("Response is not a JSON:API document: {}", err);
            (None, Vec::new())
        }
    };
    let index = IncludedIndex::build(&included);

    println!("Kind: {} ({})", spec.name, spec.path);
    println!("Include: {}", include.as_deref().unwrap_or("<none>"));
    match primary {
        Some(n) => println!("Primary resources on page 1: {} (page size {})", n, fetch.page_size),
        None => println!("Primary resources on page 1: <no data array>"),
    }
    println!("Included resources: {}", index.len());
    for (kind, count) in index.type_counts() {
        println!("  {} -> {}", kind, count);
    }
    Ok(())
}
