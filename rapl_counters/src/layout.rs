use std::path::PathBuf;

/// Where the scaphandre exporter mirrors the RAPL counters of the host.
pub const SCAPHANDRE_ROOT: &str = "/var/scaphandre";
/// Prefix of the per-package directories, as in the powercap sysfs.
pub const ZONE_PREFIX: &str = "intel-rapl";
/// Counter file of a zone, in microjoules.
pub const ENERGY_FILE: &str = "energy_uj";
/// How many package indices are probed when nothing else is specified.
pub const DEFAULT_NUM_PACKAGES: u32 = 64;

/// Describes where the per-package counter files are.
///
/// The counter of package `n` is `<root>/<zone_prefix>:<n>/<energy_file>`,
/// for instance `/var/scaphandre/intel-rapl:0/energy_uj`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterLayout {
    pub root: PathBuf,
    pub zone_prefix: String,
    pub energy_file: String,
    /// Number of package indices to probe, starting at 0.
    pub num_packages: u32,
}

impl CounterLayout {
    pub fn scaphandre() -> CounterLayout {
        CounterLayout {
            root: PathBuf::from(SCAPHANDRE_ROOT),
            zone_prefix: ZONE_PREFIX.to_owned(),
            energy_file: ENERGY_FILE.to_owned(),
            num_packages: DEFAULT_NUM_PACKAGES,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_energy_file(mut self, energy_file: impl Into<String>) -> Self {
        self.energy_file = energy_file.into();
        self
    }

    pub fn with_num_packages(mut self, num_packages: u32) -> Self {
        self.num_packages = num_packages;
        self
    }

    pub fn package_dir(&self, package: u32) -> PathBuf {
        self.root.join(format!("{}:{package}", self.zone_prefix))
    }

    pub fn counter_path(&self, package: u32) -> PathBuf {
        self.package_dir(package).join(&self.energy_file)
    }
}

impl Default for CounterLayout {
    fn default() -> Self {
        Self::scaphandre()
    }
}
