//! 🚀 pkx-cli: the front door, the valet, the guy waving the orange light-saber at the garage entrance.
//!
//! Loads config, sets up logging, runs one refresh around a point on the map and
//! prints what it found. With `--follow` it stays on and reports every change in
//! availability until Ctrl-C. The real work happens in the `pkx` crate. 🦆

mod progress;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pkx::aggregation::Availability;
use pkx::{Change, Coordinate, ListingView, RefreshOutcome, Supervisor, VehicleType};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::progress::{RefreshSpinner, listings_table};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum View {
    /// Everything the snapshot holds.
    All,
    /// Listings you author or hold a capability on.
    Own,
    Public,
    Private,
}

/// 🅿️ Find parking on relays that never heard of a database.
#[derive(Debug, Parser)]
#[command(name = "pkx", version, about)]
struct Args {
    /// TOML config file. Missing file means env vars (PKX_*) only.
    #[arg(short, long, default_value = "pkx.toml")]
    config: PathBuf,
    /// Search center latitude.
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,
    /// Search center longitude.
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,
    #[arg(long, value_enum, default_value_t = View::All)]
    view: View,
    /// Keep following the listings found until Ctrl-C.
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // 🔒 no file is fine; an unreadable path is not
    let config_file_exists = args.config.try_exists().context(format!(
        "💀 Couldn't check whether the config file exists. If it's a relative path, \
         try an absolute one. Was checking here: '{}'",
        args.config.display()
    ))?;
    let config_file = config_file_exists.then_some(args.config.as_path());

    let app_config = pkx::load_config(config_file)
        .context("💀 In pkx-cli, main, we couldn't load the config. Check the file and the PKX_* env vars.")?;

    if let Err(err) = run(app_config, &args).await {
        error!("💀 error: {}", err);
        let mut the_dump_went_missing = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("relay dump") || cause_str.contains("No such file") {
                the_dump_went_missing = true;
            }
        }
        if the_dump_went_missing {
            error!(
                "🔧 hint: a configured relay dump could not be read. Check `file_name` / `seed_file` \
                 under [[relays]], relative paths resolve from where you ran pkx. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(app_config: pkx::AppConfig, args: &Args) -> Result<()> {
    let center = match (args.lat, args.lon) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon).context("💀 that search center is not on Earth")?),
        _ => None,
    };

    let supervisor = Supervisor::from_config(&app_config).await?;

    let spinner = RefreshSpinner::start(supervisor.changes());
    let outcome = supervisor.refresh(center).await;
    match &outcome {
        RefreshOutcome::Completed(report) => spinner.finish(format!(
            "🏁 {} listings, {} child records in {:?}",
            report.listings, report.child_records, report.elapsed
        )),
        RefreshOutcome::Coalesced => spinner.finish("🛑 a refresh was already running".to_string()),
    }
    if let RefreshOutcome::Completed(report) = outcome {
        info!("🪜 public search reach: {:?}", report.public_reach);
    }

    print_listings(&supervisor, args.view).await;

    if args.follow {
        follow(&supervisor).await?;
    }
    Ok(())
}

async fn print_listings(supervisor: &Supervisor, view: View) {
    let local = supervisor.local_state().await;
    let snapshot = supervisor.store().read().await;
    let listings = match view {
        View::All => snapshot.visible_listings().collect(),
        View::Own => snapshot.listings(ListingView::Own, supervisor.user(), &local),
        View::Public => snapshot.listings(ListingView::Public, supervisor.user(), &local),
        View::Private => snapshot.listings(ListingView::Private, supervisor.user(), &local),
    };
    if listings.is_empty() {
        println!("🏜️ no listings found. Try a different center, or more relays.");
        return;
    }
    let rows = listings
        .into_iter()
        .map(|listing| (listing, snapshot.aggregate(&listing.address())));
    println!("{}", listings_table(rows));
}

async fn follow(supervisor: &Supervisor) -> Result<()> {
    let mut changes = supervisor.changes();
    let followed = supervisor.follow_current().await?;
    println!("📡 following {followed} listings. Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(Change::AggregateUpdated(address)) => {
                    let snapshot = supervisor.store().read().await;
                    let (Some(listing), Some(aggregate)) = (snapshot.listing(&address), snapshot.aggregate(&address)) else {
                        continue;
                    };
                    let summary: Vec<String> = VehicleType::ALL
                        .iter()
                        .filter_map(|vehicle| match aggregate.availability(*vehicle) {
                            Availability::Counted(counts) => Some(format!("{vehicle}: {}/{} open", counts.open, counts.total)),
                            Availability::NotAvailable => None,
                        })
                        .collect();
                    println!("🔄 {}: {}", listing.name, summary.join(", "));
                }
                Ok(Change::BacklogComplete) => info!("🏁 caught up with the relays"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    info!("🐌 fell behind by {missed} changes; the snapshot is still right, the log just skipped some");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    supervisor.stop_following().await;
    println!("👋 stopped following");
    Ok(())
}
