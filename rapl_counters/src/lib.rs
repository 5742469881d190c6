use std::{collections::BTreeMap, fmt::Display};

use clap::ValueEnum;
use enum_map::{Enum, EnumMap};

pub mod counter;
pub mod error;
pub mod layout;
pub mod powercap;
pub mod scaphandre;

pub use error::{EnergyError, UnavailableReading};
pub use layout::CounterLayout;

/// The energy domains that a RAPL-based source may be able to measure.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum EnergyDomain {
    /// power plane 0: core
    Core,
    /// power plane 1: uncore
    Uncore,
    /// DRAM
    Dram,
    /// entire socket
    Package,
}

impl EnergyDomain {
    pub const ALL: [EnergyDomain; 4] = [
        EnergyDomain::Core,
        EnergyDomain::Uncore,
        EnergyDomain::Dram,
        EnergyDomain::Package,
    ];
}

impl Display for EnergyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            EnergyDomain::Core => "core",
            EnergyDomain::Uncore => "uncore",
            EnergyDomain::Dram => "dram",
            EnergyDomain::Package => "package",
        };
        f.write_str(str)
    }
}

/// Cumulative energy of one package, split by domain, in millijoules.
///
/// A source that cannot distinguish some domains leaves them at zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeComponentsEnergy {
    pub core: u64,
    pub dram: u64,
    pub uncore: u64,
    pub pkg: u64,
}

impl NodeComponentsEnergy {
    pub fn get(&self, domain: EnergyDomain) -> u64 {
        match domain {
            EnergyDomain::Core => self.core,
            EnergyDomain::Uncore => self.uncore,
            EnergyDomain::Dram => self.dram,
            EnergyDomain::Package => self.pkg,
        }
    }

    pub fn set(&mut self, domain: EnergyDomain, millijoules: u64) {
        match domain {
            EnergyDomain::Core => self.core = millijoules,
            EnergyDomain::Uncore => self.uncore = millijoules,
            EnergyDomain::Dram => self.dram = millijoules,
            EnergyDomain::Package => self.pkg = millijoules,
        }
    }
}

/// The result of one query of a source: per-package values and per-domain totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnergySnapshot {
    pub per_package: BTreeMap<u32, NodeComponentsEnergy>,
    /// Totals of the requested domains, `None` for the others and for the unsupported ones.
    pub totals: EnumMap<EnergyDomain, Option<u64>>,
}

/// A source of cumulative RAPL energy counters.
///
/// All the values are absolute (not deltas) and expressed in millijoules.
/// Implementations hold no open file between two calls: every query reads
/// the counters again.
///
/// ## Usage
///
/// ```no_run
/// use rapl_counters::{scaphandre::ScaphandreSource, CounterLayout, EnergyDomain, EnergySource};
///
/// let source = ScaphandreSource::new(CounterLayout::scaphandre());
/// if source.is_system_collection_supported() {
///     let total = source.absolute_energy(EnergyDomain::Package).unwrap();
///     println!("{total} mJ consumed by all the packages");
///     for (pkg, energy) in source.absolute_energy_per_package() {
///         println!("package {pkg}: {} mJ", energy.pkg);
///     }
/// }
/// ```
///
/// ## Domains
///
/// Not every source can measure every [`EnergyDomain`]. Querying a domain for which
/// [`EnergySource::supports`] returns `false` yields [`EnergyError::UnsupportedDomain`].
/// This is a permanent limitation of the source, retrying will not help.
pub trait EnergySource: Send + Sync {
    /// A short name that identifies the source.
    fn name(&self) -> &str;

    /// Checks, right now, whether the counters can be read on this system.
    fn is_system_collection_supported(&self) -> bool;

    /// Returns `true` if the source is able to measure `domain`.
    fn supports(&self, domain: EnergyDomain) -> bool;

    /// Returns the energy consumed by `domain`, summed over all the packages.
    fn absolute_energy(&self, domain: EnergyDomain) -> Result<u64, EnergyError>;

    /// Returns the energy of each package whose counters could be read.
    fn absolute_energy_per_package(&self) -> BTreeMap<u32, NodeComponentsEnergy>;

    /// Releases the resources of the source, if any.
    fn stop(&mut self);

    /// Queries the per-package values and the totals of `domains` at once.
    ///
    /// The default implementation reads the counters once per query, sources that can
    /// should override it so that the totals and the per-package values come from the same reading.
    fn energy_snapshot(&self, domains: &[EnergyDomain]) -> EnergySnapshot {
        let mut totals = EnumMap::default();
        for &domain in domains {
            totals[domain] = self.absolute_energy(domain).ok();
        }
        EnergySnapshot {
            per_package: self.absolute_energy_per_package(),
            totals,
        }
    }

    fn supported_domains(&self) -> EnumMap<EnergyDomain, bool> {
        EnumMap::from_fn(|d| self.supports(d))
    }

    fn core_energy(&self) -> Result<u64, EnergyError> {
        self.absolute_energy(EnergyDomain::Core)
    }

    fn uncore_energy(&self) -> Result<u64, EnergyError> {
        self.absolute_energy(EnergyDomain::Uncore)
    }

    fn dram_energy(&self) -> Result<u64, EnergyError> {
        self.absolute_energy(EnergyDomain::Dram)
    }

    fn package_energy(&self) -> Result<u64, EnergyError> {
        self.absolute_energy(EnergyDomain::Package)
    }
}
