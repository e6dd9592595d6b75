//! 📊 "Are we there yet?" for refreshes, and a comfy table for when we are.
//!
//! A spinner follows the change feed while a refresh runs: one line per finished
//! phase, a counter for child batches as they land. Once it's done, listings and
//! their per-vehicle counts go into a table. 🦆

use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use indicatif::{ProgressBar, ProgressStyle};
use pkx::aggregation::{Availability, CountBasis, ListingAggregate};
use pkx::{Change, Listing, VehicleType};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// 🌀 Spins until the refresh is over, narrating the change feed.
pub(crate) struct RefreshSpinner {
    bar: ProgressBar,
    narrator: JoinHandle<()>,
}

impl RefreshSpinner {
    pub(crate) fn start(mut changes: broadcast::Receiver<Change>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message("asking the relays nicely");

        let narrated = bar.clone();
        let narrator = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Change::PhaseCompleted { phase, records }) => {
                        narrated.println(format!("✅ {phase}: {records} records"));
                    }
                    Ok(Change::ChildBatchApplied { batch, of }) => {
                        narrated.set_message(format!("children: batch {batch}/{of}"));
                    }
                    Ok(Change::SnapshotReplaced { listings }) => {
                        narrated.set_message(format!("{listings} listings merged, fetching spots"));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Self { bar, narrator }
    }

    pub(crate) fn finish(self, message: String) {
        self.narrator.abort();
        self.bar.finish_with_message(message);
    }
}

fn availability_cell(aggregate: Option<&ListingAggregate>, vehicle: VehicleType) -> Cell {
    let text = match aggregate.map(|aggregate| aggregate.availability(vehicle)) {
        Some(Availability::Counted(counts)) => {
            format!("{} open / {} busy / {}", counts.open, counts.occupied, counts.total)
        }
        Some(Availability::NotAvailable) | None => "n/a".to_string(),
    };
    Cell::new(text).set_alignment(CellAlignment::Right)
}

fn basis_label(aggregate: Option<&ListingAggregate>) -> String {
    match aggregate {
        Some(aggregate) => match aggregate.basis {
            CountBasis::Discovered => "spots".to_string(),
            CountBasis::StatusOnly => "statuses".to_string(),
            // 🧂 advisory totals are shown with a grain of salt, never counted
            CountBasis::Advisory => format!("~{} advertised", aggregate.advisory_total.unwrap_or(0)),
            CountBasis::Nothing => "-".to_string(),
        },
        None => "-".to_string(),
    }
}

/// 🍽️ One row per listing, one column per vehicle type.
pub(crate) fn listings_table<'a>(
    rows: impl IntoIterator<Item = (&'a Listing, Option<&'a ListingAggregate>)>,
) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![Cell::new("listing"), Cell::new("where"), Cell::new("counted from")];
    header.extend(VehicleType::ALL.iter().map(|vehicle| Cell::new(vehicle.as_str())));
    header.push(Cell::new("state"));
    table.set_header(header);

    for (listing, aggregate) in rows {
        let mut row = vec![
            Cell::new(&listing.name),
            Cell::new(&listing.geohash),
            Cell::new(basis_label(aggregate)),
        ];
        row.extend(VehicleType::ALL.iter().map(|vehicle| availability_cell(aggregate, *vehicle)));
        let closed = !listing.open || aggregate.is_some_and(ListingAggregate::is_closed);
        row.push(Cell::new(if closed { "closed" } else { "open" }));
        table.add_row(row);
    }
    table
}
