pub mod types;
pub mod config;
pub mod error;
pub mod clock;
pub mod data;
pub mod kml;
pub mod grid;
pub mod quota;
pub mod cache;
pub mod geocoder;
pub mod retry;
pub mod processing;
pub mod export;
pub mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{SystemClock, ThreadSleeper};
use crate::config::AppConfig;
use crate::geocoder::{Geocoder, Nominatim};
use crate::processing::{ExtractionPipeline, Outcome, Progress, Session};
use crate::retry::{RetryPolicy, RetryingGeocodeClient};
use crate::types::{NamedPolygon, SurveyPolygon};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the addresses inside a polygon from a KML or GeoJSON file
    Extract {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Polygon file (.kml, .geojson or .json)
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Polygon id, name or 1-based index (defaults to the first polygon)
        #[arg(short, long)]
        polygon: Option<String>,
        /// Grid spacing in degrees
        #[arg(short, long)]
        spacing: Option<f64>,
        /// Write the address table as CSV to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List the polygons in a KML or GeoJSON file
    Polygons {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },
    /// Look up a place by name or address
    Search {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        query: String,
    },
    /// Build a KML document from files of "longitude,latitude" lines, one polygon per file
    Kml {
        /// Polygon name; numbered when several files are given
        #[arg(short, long, default_value = "My Polygon")]
        name: String,
        #[arg(long, value_name = "FILE", required = true, num_args = 1..)]
        coords: Vec<PathBuf>,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Serve the extraction API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn build_pipeline(config: &AppConfig) -> ExtractionPipeline {
    let client = RetryingGeocodeClient::new(
        Arc::new(Nominatim::new(&config.geocoder)),
        Arc::new(ThreadSleeper),
        RetryPolicy::from(&config.geocoder),
    );
    ExtractionPipeline::new(config, client, Arc::new(SystemClock))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract { config, input, polygon, spacing, output } => {
            let app_config = AppConfig::load_or_default(&config)?;

            let polygons = data::load_polygons(&input)?;
            let chosen = data::select(&polygons, polygon.as_deref())?;
            println!("Using polygon '{}' ({})", chosen.name, chosen.id);
            let survey = SurveyPolygon::from_lon_lat(&chosen.coordinates)?;
            let spacing = spacing.unwrap_or(app_config.grid.default_spacing);

            // Ctrl-C stops dispatching; whatever was found so far is kept.
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = stop.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        stop.store(true, Ordering::SeqCst);
                    }
                });
            }

            let pipeline = build_pipeline(&app_config);
            let report = tokio::task::spawn_blocking(move || {
                let mut session = Session::new(&app_config, pipeline.now());
                let batch = pipeline.prepare(&mut session, &survey, spacing)?;
                println!(
                    "Area {:.3} km², {} grid points",
                    batch.area_km2(),
                    batch.points().len()
                );
                let mut on_progress = |p: Progress| {
                    eprint!("\rProcessed {}/{} points ({:.0}%)", p.processed, p.total, p.fraction() * 100.0);
                    if stop.load(Ordering::SeqCst) {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                };
                let report = pipeline.run(&mut session, batch, &mut on_progress);
                eprintln!();
                Ok::<_, error::ExtractError>(report)
            })
            .await??;

            match report.outcome {
                Outcome::NoPointsGenerated => {
                    println!("No points generated. Try a smaller grid spacing.");
                    return Ok(());
                }
                Outcome::NoAddressesFound => {
                    println!("No addresses found in the selected area.");
                    return Ok(());
                }
                Outcome::Stopped => println!(
                    "Stopped after {}/{} points.",
                    report.processed, report.total_points
                ),
                Outcome::Completed => {}
            }

            println!("Found {} unique addresses", report.records.len());
            if report.failures.total() > 0 {
                println!(
                    "Skipped {} points ({} without address, {} after retries, {} failed)",
                    report.failures.total(),
                    report.failures.not_found,
                    report.failures.exhausted,
                    report.failures.permanent + report.failures.invalid,
                );
            }

            match output {
                Some(path) => {
                    export::save_csv(&report.records, &path)?;
                    println!("Wrote {:?}", path);
                }
                None => export::write_csv(&report.records, std::io::stdout().lock())?,
            }
        }
        Commands::Polygons { config, input } => {
            let app_config = AppConfig::load_or_default(&config)?;
            let guard = quota::QuotaGuard::new(app_config.limits.clone());

            for (i, p) in data::load_polygons(&input)?.iter().enumerate() {
                let status = match SurveyPolygon::from_lon_lat(&p.coordinates) {
                    Ok(survey) => match guard.check_area(&survey) {
                        Ok(area) => format!("{:.3} km²", area),
                        Err(e) => e.to_string(),
                    },
                    Err(e) => e.to_string(),
                };
                println!("{:>3}  {:<20} {:<24} {} vertices  {}", i + 1, p.id, p.name, p.coordinates.len(), status);
            }
        }
        Commands::Search { config, query } => {
            let app_config = AppConfig::load_or_default(&config)?;
            let provider = Nominatim::new(&app_config.geocoder);
            let found = tokio::task::spawn_blocking(move || provider.search(&query)).await??;
            match found {
                Some(place) => println!("Found: {} ({:.6}, {:.6})", place.address, place.lat, place.lon),
                None => println!("Location not found. Please try a different search term."),
            }
        }
        Commands::Kml { name, coords, output } => {
            let mut polygons = Vec::with_capacity(coords.len());
            for (i, path) in coords.iter().enumerate() {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read coordinates: {:?}", path))?;
                polygons.push(NamedPolygon {
                    name: if coords.len() == 1 { name.clone() } else { format!("{} {}", name, i + 1) },
                    coordinates: kml::parse_coordinate_lines(&text),
                    id: format!("kml_polygon_{i}"),
                });
            }
            let document = kml::write_document(&polygons)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, document)?;
                    println!("Wrote {:?}", path);
                }
                None => print!("{}", document),
            }
        }
        Commands::Serve { config } => {
            println!("Serving extraction API with config: {:?}", config);
            let app_config = AppConfig::load_or_default(&config)?;
            let pipeline = build_pipeline(&app_config);
            server::start_server(app_config, pipeline).await?;
        }
    }

    Ok(())
}
