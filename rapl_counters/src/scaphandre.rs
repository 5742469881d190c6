// Scaphandre (https://github.com/hubblo-org/scaphandre) can run on a hypervisor and
// copy the RAPL counters of the host into a directory that is shared with the guests,
// with the same layout as the powercap sysfs: `<root>/intel-rapl:<n>/energy_uj`.
// Only the package counters are mirrored, the sub-zones (core, dram...) are not.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use enum_map::EnumMap;

use crate::{
    counter::{read_counter, wrapping_sum, CounterReading},
    CounterLayout, EnergyDomain, EnergyError, EnergySnapshot, EnergySource, NodeComponentsEnergy,
};

const SOURCE_NAME: &str = "rapl-sysfs-scaphandre";

/// The counter of one package, in millijoules, or the reason why it is unavailable.
pub type PackageReading = CounterReading;

/// The counter files that were readable at discovery time, by package index.
///
/// The table is never modified after its creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterPathTable {
    paths: BTreeMap<u32, PathBuf>,
}

impl CounterPathTable {
    /// Probes the packages `0..layout.num_packages` and keeps those whose counter file can be read.
    ///
    /// A missing file is not an error: it only means that the package is not supported.
    pub fn discover(layout: &CounterLayout) -> CounterPathTable {
        let mut paths = BTreeMap::new();
        for pkg in 0..layout.num_packages {
            let path = layout.counter_path(pkg);
            match fs::read(&path) {
                Ok(_) => {
                    paths.insert(pkg, path);
                }
                Err(e) => debug!("skipping package {pkg}: {path:?} is not readable ({e})"),
            }
        }
        info!(
            "{}/{} package counters found in {:?}",
            paths.len(),
            layout.num_packages,
            layout.root
        );
        CounterPathTable { paths }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (u32, PathBuf)>) -> CounterPathTable {
        CounterPathTable {
            paths: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, package: u32) -> Option<&Path> {
        self.paths.get(&package).map(PathBuf::as_path)
    }

    pub fn packages(&self) -> impl Iterator<Item = u32> + '_ {
        self.paths.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Path)> {
        self.paths.iter().map(|(pkg, path)| (*pkg, path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Keeps the successful readings and logs the others.
pub fn available_readings(readings: BTreeMap<u32, PackageReading>) -> BTreeMap<u32, u64> {
    readings
        .into_iter()
        .filter_map(|(pkg, reading)| match reading {
            Ok(millijoules) => Some((pkg, millijoules)),
            Err(e) => {
                // {:#} prints the whole chain of errors, e.g. the underlying io error
                debug!("package {pkg} unavailable: {:#}", anyhow::Error::from(e));
                None
            }
        })
        .collect()
}

/// Sums the energy of all the packages. Returns zero if there is none.
///
/// The sum wraps around on overflow.
pub fn sum_available(energy: &BTreeMap<u32, u64>) -> u64 {
    wrapping_sum(energy.values().copied())
}

/// The single value of a package, spread over the per-package record.
fn package_record(millijoules: u64) -> NodeComponentsEnergy {
    NodeComponentsEnergy {
        core: millijoules,
        dram: 0,
        uncore: 0,
        pkg: millijoules,
    }
}

/// Energy source backed by the counters mirrored by scaphandre.
///
/// Each package exposes a single value, which covers the whole socket.
/// It is reported as the `Package` and `Uncore` domains, `Core` and `Dram` are not supported.
///
/// Note that summing `Uncore` and `Package` counts the same energy twice.
#[derive(Debug, Clone)]
pub struct ScaphandreSource {
    layout: CounterLayout,
    table: CounterPathTable,
}

impl ScaphandreSource {
    /// Creates a source by discovering the counters described by `layout`.
    pub fn new(layout: CounterLayout) -> ScaphandreSource {
        let table = CounterPathTable::discover(&layout);
        ScaphandreSource { layout, table }
    }

    /// Creates a source from an existing path table.
    pub fn with_table(layout: CounterLayout, table: CounterPathTable) -> ScaphandreSource {
        ScaphandreSource { layout, table }
    }

    pub fn layout(&self) -> &CounterLayout {
        &self.layout
    }

    pub fn table(&self) -> &CounterPathTable {
        &self.table
    }

    /// Reads the counter of every discovered package.
    pub fn read_all(&self) -> BTreeMap<u32, PackageReading> {
        self.table
            .iter()
            .map(|(pkg, path)| (pkg, read_counter(path)))
            .collect()
    }

    /// Reads the counter of every discovered package, omitting the ones that fail.
    pub fn read_energy(&self) -> BTreeMap<u32, u64> {
        available_readings(self.read_all())
    }

    fn total_energy(&self) -> u64 {
        sum_available(&self.read_energy())
    }
}

impl EnergySource for ScaphandreSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn is_system_collection_supported(&self) -> bool {
        // checked now, not in the discovery table
        fs::read(self.layout.counter_path(0)).is_ok()
    }

    fn supports(&self, domain: EnergyDomain) -> bool {
        matches!(domain, EnergyDomain::Uncore | EnergyDomain::Package)
    }

    fn absolute_energy(&self, domain: EnergyDomain) -> Result<u64, EnergyError> {
        if self.supports(domain) {
            Ok(self.total_energy())
        } else {
            Err(EnergyError::UnsupportedDomain {
                source_name: SOURCE_NAME.to_owned(),
                domain,
            })
        }
    }

    fn absolute_energy_per_package(&self) -> BTreeMap<u32, NodeComponentsEnergy> {
        self.read_energy()
            .into_iter()
            .map(|(pkg, millijoules)| (pkg, package_record(millijoules)))
            .collect()
    }

    fn energy_snapshot(&self, domains: &[EnergyDomain]) -> EnergySnapshot {
        // one reading for both the totals and the per-package values
        let energy = self.read_energy();
        let total = sum_available(&energy);
        let mut totals = EnumMap::default();
        for &domain in domains {
            if self.supports(domain) {
                totals[domain] = Some(total);
            }
        }
        let per_package = energy
            .into_iter()
            .map(|(pkg, millijoules)| (pkg, package_record(millijoules)))
            .collect();
        EnergySnapshot { per_package, totals }
    }

    fn stop(&mut self) {
        // nothing is kept open
    }
}
