//! Event store commands.
//!
//! Read-only inspection of the configured event store.

use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use modulith_core::config::Config;
use modulith_core::store::{self, EventStore, StoredEvent};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EventsCommands {
    /// List stored events, oldest first
    List {
        /// Number of events to skip
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u64,

        /// Only events with this event type
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
    },

    /// Count stored events
    Count,

    /// Show the event stream of one aggregate
    Aggregate {
        /// Aggregate ID
        aggregate_id: String,

        /// Aggregate type; all types when omitted
        #[arg(short = 't', long = "type")]
        aggregate_type: Option<String>,

        /// First version to show
        #[arg(long, default_value = "1")]
        from_version: i64,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct EventRow {
    #[tabled(rename = "Aggregate")]
    aggregate: String,
    #[tabled(rename = "Version")]
    version: i64,
    #[tabled(rename = "Event")]
    event_type: String,
    #[tabled(rename = "Occurred At")]
    occurred_at: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&StoredEvent> for EventRow {
    fn from(event: &StoredEvent) -> Self {
        Self {
            aggregate: event.key().to_string(),
            version: event.version,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            id: event.id.to_string(),
        }
    }
}

pub async fn execute(cmd: EventsCommands, config: &Config, format: OutputFormat) -> Result<()> {
    let store: Arc<dyn EventStore> = store::connect(&config.event_store).await?;

    match cmd {
        EventsCommands::List {
            offset,
            limit,
            event_type,
        } => {
            let events = match event_type {
                Some(event_type) => {
                    let events = store.get_events_by_type(&event_type).await?;
                    events
                        .into_iter()
                        .skip(usize::try_from(offset)?)
                        .take(usize::try_from(limit)?)
                        .collect()
                }
                None => store.get_events_paginated(offset, limit).await?,
            };
            print_events(&events, format)
        }
        EventsCommands::Count => {
            let count = store.get_event_count().await?;
            match format {
                OutputFormat::Table => {
                    output::print_detail("Backend", store.backend_name());
                    output::print_detail("Events", &count.to_string());
                    Ok(())
                }
                _ => output::print_item(
                    &serde_json::json!({ "backend": store.backend_name(), "events": count }),
                    format,
                ),
            }
        }
        EventsCommands::Aggregate {
            aggregate_id,
            aggregate_type,
            from_version,
        } => {
            let events = store
                .get_events_from_version(&aggregate_id, from_version, aggregate_type.as_deref())
                .await?;
            let version = store
                .get_aggregate_version(&aggregate_id, aggregate_type.as_deref())
                .await?;
            if matches!(format, OutputFormat::Table) {
                output::print_header(&format!("Aggregate {} (version {})", aggregate_id, version));
            }
            print_events(&events, format)
        }
    }
}

fn print_events(events: &[StoredEvent], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
            output::print_list(&rows, format)
        }
        _ => output::print_item(&events, format),
    }
}
