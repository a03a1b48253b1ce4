use anyhow::{Context, Result};
use earthaccess::{AccessClass, Client, TransferOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // RUST_LOG=earthaccess=debug shows every page request and retry.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure authentication via EARTHDATA_TOKEN or a `.netrc` entry.
    let client = Client::from_env()?;

    let collections = client.search(
        client.collections().short_name("ATL06").cloud_hosted(true),
        Some(1),
    )?;
    let collection = collections.first().context("ATL06 collection not found")?;
    println!("collection: {}", collection.summary());

    let query = client
        .granules()
        .concept_id([collection.concept_id()])
        .temporal("2020-02", "2020-03")
        .bounding_box(-46.5, 61.0, -42.5, 63.0)
        .build()?;
    println!("{} granules match", client.count(&query)?);

    let granules = client.get(&query, Some(5))?;
    let options = TransferOptions::download("atl06")
        .with_access(AccessClass::External)
        .with_concurrency(4);
    let report = client.transfer(&granules, &options)?;

    for path in report.files() {
        println!("ok     {}", path.display());
    }
    for failure in &report.failed {
        println!("failed {} ({})", failure.record.concept_id(), failure.error);
    }
    Ok(())
}
