use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use cli::{Cli, Commands, OutputType, SourceType};
use log::{info, warn};
use rapl_counters::{
    powercap::{self, PowercapSource},
    scaphandre::ScaphandreSource,
    CounterLayout, EnergyDomain, EnergySource,
};

mod cli;
mod poll;

const MEASUREMENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // discover the counters, once
    let mut source: Box<dyn EnergySource> = match cli.source {
        SourceType::Scaphandre => {
            let mut layout = CounterLayout::scaphandre()
                .with_num_packages(cli.packages)
                .with_energy_file(cli.energy_file);
            if let Some(root) = cli.root {
                layout = layout.with_root(root);
            }
            Box::new(ScaphandreSource::new(layout))
        }
        SourceType::Powercap => {
            let root = cli.root.unwrap_or_else(|| powercap::POWERCAP_RAPL_PATH.into());
            Box::new(PowercapSource::new(&root)?)
        }
    };

    let supported: Vec<EnergyDomain> = EnergyDomain::ALL.into_iter().filter(|d| source.supports(*d)).collect();
    info!("Energy source {}, supported domains: {}", source.name(), mkstring(&supported, ", "));
    if !source.is_system_collection_supported() {
        warn!("The counters of package 0 cannot be read, the measurements will probably be empty.");
    }

    // run the command
    match cli.command {
        Commands::Info => {
            println!("\nEnergy source: {}", source.name());
            println!("System collection supported: {}", source.is_system_collection_supported());
            println!("Supported domains: {}", mkstring(&supported, ", "));

            println!("\nEnergy per package (mJ):");
            for (pkg, energy) in source.absolute_energy_per_package() {
                println!("- package {pkg}: {energy:?}");
            }

            println!("\nTotal energy (mJ):");
            for domain in EnergyDomain::ALL {
                match source.absolute_energy(domain) {
                    Ok(total) => println!("- {domain}: {total}"),
                    Err(e) => println!("- {domain}: {e}"),
                }
            }
        }
        Commands::Poll {
            domains,
            frequency,
            output,
            output_file,
        } => {
            // compute the polling period, or stop if zero
            let polling_period = match poll::polling_period(frequency)? {
                None => {
                    info!("Frequency set to zero, stopping here.");
                    return Ok(());
                }
                Some(period) => {
                    if frequency < 0.0 {
                        info!("Negative frequency, which means continuous polling.");
                    }
                    period
                }
            };

            // check the domains against what the source can measure
            let domains = poll::check_domains(domains, source.as_ref())?;

            // prepare the output, if any
            let writer: Box<dyn Write + Send> = match output {
                OutputType::None => Box::new(std::io::sink()),
                OutputType::Stdout => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
                OutputType::File => {
                    let filename = if let Some(f) = output_file {
                        f
                    } else {
                        // create the csv file
                        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                        format!("poll-{now}.csv")
                    };
                    info!("Writing measurements to {:?}", Path::new(&filename));
                    let file = File::create(filename)?;
                    Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file))
                }
            };

            poll::run(
                writer,
                source.as_ref(),
                &domains,
                polling_period,
                MEASUREMENTS_FLUSH_INTERVAL,
            )
            .await?;
        }
    }

    source.stop();
    Ok(())
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
