use rapl_counters::{EnergyDomain, EnergySnapshot, EnergySource, NodeComponentsEnergy};

use anyhow::{anyhow, Context};
use enum_map::EnumMap;
use futures::stream::StreamExt;
use log::info;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, Sender};
use tokio_timerfd::Interval;

pub const CSV_HEADER: &str = "timestamp_ms;package;domain;millijoules\n";

/// Turns a frequency in Hertz into a polling period.
///
/// Returns `None` if the frequency is zero (nothing to poll) and a zero period
/// if it is negative (continuous polling).
pub fn polling_period(frequency: f64) -> anyhow::Result<Option<Duration>> {
    if !frequency.is_finite() {
        return Err(anyhow!("Invalid frequency {frequency}: must be a finite number"));
    }
    if frequency == 0.0 {
        Ok(None)
    } else if frequency < 0.0 {
        Ok(Some(Duration::ZERO))
    } else {
        let period = Duration::try_from_secs_f64(1.0 / frequency)
            .with_context(|| format!("Invalid frequency {frequency}: the polling period is out of range"))?;
        Ok(Some(period))
    }
}

/// Checks the requested domains against the ones that `source` supports.
///
/// An empty request selects all the supported domains.
pub fn check_domains(requested: Vec<EnergyDomain>, source: &dyn EnergySource) -> anyhow::Result<Vec<EnergyDomain>> {
    let supported: Vec<EnergyDomain> = EnergyDomain::ALL.into_iter().filter(|d| source.supports(*d)).collect();
    if requested.is_empty() {
        return Ok(supported);
    }
    let unsupported: Vec<String> = requested
        .iter()
        .filter(|d| !supported.contains(d))
        .map(|d| d.to_string())
        .collect();
    if !unsupported.is_empty() {
        return Err(anyhow!(
            "Invalid selected domains: {}, source {} does not support them",
            unsupported.join(", "),
            source.name()
        ));
    }
    Ok(requested)
}

pub async fn run(
    mut writer: Box<dyn Write + Send>,
    source: &dyn EnergySource,
    domains: &[EnergyDomain],
    polling_period: Duration,
    measurement_flush_interval: Duration,
) -> anyhow::Result<()> {
    // open a Channel to write to the output in another thread
    let (tx, mut rx) = mpsc::channel::<MeasurementsMessage>(4096);

    // Start the writer task, which will receive the data from the channel and write
    // it to the selected output.
    let handle = tokio::spawn(async move {
        let mut previous_timestamp: SystemTime = SystemTime::now();

        writer.write_all(CSV_HEADER.as_bytes())?;
        while let Some(msg) = rx.recv().await {
            print_measurements(&mut writer, &msg)?;

            let time_since_last_flush = msg
                .timestamp
                .duration_since(previous_timestamp)
                .unwrap_or(Duration::ZERO);

            if time_since_last_flush >= measurement_flush_interval {
                previous_timestamp = msg.timestamp;
                writer.flush()?;
            }
        }
        writer.flush()?;
        anyhow::Ok(())
    });

    // Poll the counters at regular intervals until Ctrl-C, and send the data to the writer task.
    // When polling stops, `tx` is dropped, which terminates the writer task.
    tokio::select! {
        res = poll_energy_source(source, domains, polling_period, tx) => res.context("polling the energy source")?,
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl-C")?;
            info!("Interrupted, stopping.");
        }
    }

    handle.await?.context("writer task error")?;
    Ok(())
}

#[derive(Debug)]
pub(crate) struct MeasurementsMessage {
    pub timestamp: SystemTime,
    pub per_package: BTreeMap<u32, NodeComponentsEnergy>,
    /// Totals of the requested domains, `None` for the others.
    pub totals: EnumMap<EnergyDomain, Option<u64>>,
}

/// Queries the source once.
pub(crate) fn snapshot(source: &dyn EnergySource, domains: &[EnergyDomain]) -> MeasurementsMessage {
    let timestamp = SystemTime::now();
    let EnergySnapshot { per_package, totals } = source.energy_snapshot(domains);
    MeasurementsMessage {
        timestamp,
        per_package,
        totals,
    }
}

async fn poll_energy_source(
    source: &dyn EnergySource,
    domains: &[EnergyDomain],
    period: Duration,
    tx: Sender<MeasurementsMessage>,
) -> anyhow::Result<()> {
    // Underneath, this uses a periodic timer from timerfd, which has a higher resolution than std::time::sleep and tokio::time::sleep
    // A zero period would disarm the timer, in that case we poll continuously.
    let mut interval = if period.is_zero() {
        None
    } else {
        Some(Interval::new_interval(period)?)
    };

    loop {
        // wait for the next tick of the periodic timer
        match interval.as_mut() {
            Some(interval) => {
                interval.next().await.transpose().context("periodic timer failed")?;
            }
            None => tokio::task::yield_now().await,
        }

        let msg = snapshot(source, domains);
        tx.send(msg).await.context("failed to send measurements through channel")?;
    }
}

pub(crate) fn print_measurements(writer: &mut dyn Write, msg: &MeasurementsMessage) -> anyhow::Result<()> {
    let timestamp_ms = msg.timestamp.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();

    for (package, energy) in &msg.per_package {
        for (domain, total) in &msg.totals {
            if total.is_some() {
                let millijoules = energy.get(domain);
                writeln!(writer, "{timestamp_ms};{package};{domain};{millijoules}")?;
            }
        }
    }
    for (domain, total) in &msg.totals {
        if let Some(millijoules) = total {
            writeln!(writer, "{timestamp_ms};total;{domain};{millijoules}")?;
        }
    }
    Ok(())
}
