// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use enum_map::EnumMap;
use log::{debug, info};

use crate::{
    counter::{read_counter, wrapping_sum},
    layout::{ENERGY_FILE, ZONE_PREFIX},
    EnergyDomain, EnergyError, EnergySnapshot, EnergySource, NodeComponentsEnergy,
};

pub const POWERCAP_RAPL_PATH: &str = "/sys/class/powercap/intel-rapl";
const SOURCE_NAME: &str = "rapl-sysfs";

/// Hierarchy of power zones
#[derive(Debug)]
pub struct PowerZoneHierarchy {
    /// All the zones in the same Vec.
    pub flat: Vec<PowerZone>,
    /// The top zones. To access their children, use [PowerZone::children].
    pub top: Vec<PowerZone>,
}

/// A power zone.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The energy domain measured by the zone
    pub domain: EnergyDomain,

    /// The path of the zone in sysfs, for instance
    /// `/sys/class/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone
    pub socket_id: u32,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join(ENERGY_FILE)
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let powercap_name = &self.name;
        let domain = self.domain;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {powercap_name} ({domain}) \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

fn parse_zone_name(name: &str) -> Option<EnergyDomain> {
    match name {
        "core" => Some(EnergyDomain::Core),
        "uncore" => Some(EnergyDomain::Uncore),
        "dram" => Some(EnergyDomain::Dram),
        _ if name.starts_with("package-") => Some(EnergyDomain::Package),
        _ => None,
    }
}

/// Discovers all the RAPL power zones under `root`, usually [`POWERCAP_RAPL_PATH`].
///
/// Zones that do not belong to a package (e.g. `psys`) are ignored, as well as their children.
pub fn all_power_zones(root: &Path) -> anyhow::Result<PowerZoneHierarchy> {
    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir).with_context(|| format!("failed to list {dir:?}"))? {
            let entry = e?;
            let path = entry.path();
            let is_zone = entry.file_name().to_string_lossy().starts_with(ZONE_PREFIX);

            if path.is_dir() && is_zone {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)
                    .with_context(|| format!("failed to read {name_path:?}"))?
                    .trim()
                    .to_owned();
                let socket_id = match (parent_socket, name.strip_prefix("package-")) {
                    (Some(parent_id), _) => parent_id,
                    (None, Some(id_str)) => id_str
                        .parse()
                        .with_context(|| format!("Failed to extract package id from '{name}'"))?,
                    (None, None) => {
                        debug!("ignoring power zone {name} at {path:?}: not in a package");
                        continue;
                    }
                };
                let Some(domain) = parse_zone_name(&name) else {
                    debug!("ignoring unknown power zone {name} at {path:?}");
                    continue;
                };
                let children = explore_rec(&path, Some(socket_id), flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    domain,
                    path,
                    children,
                    socket_id,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let mut flat = Vec::new();
    let top = explore_rec(root, None, &mut flat)?;
    flat.sort_by_key(|z| z.path.to_string_lossy().to_string());
    Ok(PowerZoneHierarchy { flat, top })
}

/// Energy source backed by the powercap sysfs, which exposes one counter per domain.
#[derive(Debug, Clone)]
pub struct PowercapSource {
    /// Zones discovered at startup, in path order.
    zones: Vec<PowerZone>,
}

impl PowercapSource {
    /// Discovers the power zones under `root`.
    pub fn new(root: &Path) -> anyhow::Result<PowercapSource> {
        let hierarchy = all_power_zones(root)?;
        info!("{} powercap zones found in {root:?}", hierarchy.flat.len());
        Ok(Self::with_zones(hierarchy.flat))
    }

    pub fn with_zones(zones: Vec<PowerZone>) -> PowercapSource {
        PowercapSource { zones }
    }

    pub fn zones(&self) -> &[PowerZone] {
        &self.zones
    }

    /// Reads every zone once, the unreadable ones are omitted.
    fn read_zones(&self) -> Vec<(&PowerZone, u64)> {
        self.zones
            .iter()
            .filter_map(|zone| match read_counter(&zone.energy_path()) {
                Ok(millijoules) => Some((zone, millijoules)),
                Err(e) => {
                    debug!("zone {} of package {} unavailable: {:#}", zone.name, zone.socket_id, anyhow::Error::from(e));
                    None
                }
            })
            .collect()
    }

    fn unsupported(domain: EnergyDomain) -> EnergyError {
        EnergyError::UnsupportedDomain {
            source_name: SOURCE_NAME.to_owned(),
            domain,
        }
    }
}

fn domain_total(readings: &[(&PowerZone, u64)], domain: EnergyDomain) -> u64 {
    wrapping_sum(readings.iter().filter(|(z, _)| z.domain == domain).map(|(_, v)| *v))
}

fn energy_per_package(readings: &[(&PowerZone, u64)]) -> BTreeMap<u32, NodeComponentsEnergy> {
    let mut packages: BTreeMap<u32, (bool, NodeComponentsEnergy)> = BTreeMap::new();
    for (zone, millijoules) in readings {
        let (has_pkg, energy) = packages.entry(zone.socket_id).or_default();
        energy.set(zone.domain, *millijoules);
        if zone.domain == EnergyDomain::Package {
            *has_pkg = true;
        }
    }
    // a package without its own counter is not reported
    packages
        .into_iter()
        .filter_map(|(socket, (has_pkg, energy))| has_pkg.then_some((socket, energy)))
        .collect()
}

impl EnergySource for PowercapSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn is_system_collection_supported(&self) -> bool {
        self.zones
            .iter()
            .find(|z| z.domain == EnergyDomain::Package && z.socket_id == 0)
            .is_some_and(|z| fs::read(z.energy_path()).is_ok())
    }

    fn supports(&self, domain: EnergyDomain) -> bool {
        self.zones.iter().any(|z| z.domain == domain)
    }

    fn absolute_energy(&self, domain: EnergyDomain) -> Result<u64, EnergyError> {
        if !self.supports(domain) {
            return Err(Self::unsupported(domain));
        }
        Ok(domain_total(&self.read_zones(), domain))
    }

    fn absolute_energy_per_package(&self) -> BTreeMap<u32, NodeComponentsEnergy> {
        energy_per_package(&self.read_zones())
    }

    fn energy_snapshot(&self, domains: &[EnergyDomain]) -> EnergySnapshot {
        let readings = self.read_zones();
        let mut totals = EnumMap::default();
        for &domain in domains {
            if self.supports(domain) {
                totals[domain] = Some(domain_total(&readings, domain));
            }
        }
        EnergySnapshot {
            per_package: energy_per_package(&readings),
            totals,
        }
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use tempfile::tempdir;

    use super::{all_power_zones, PowercapSource};
    use crate::{EnergyDomain, EnergyError, EnergySource, NodeComponentsEnergy};

    fn make_zone(dir: &Path, name: &str, energy_uj: Option<&str>) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{name}\n")).unwrap();
        if let Some(value) = energy_uj {
            fs::write(dir.join("energy_uj"), value).unwrap();
        }
    }

    /// Two packages, package 0 has core and dram sub-zones, plus a psys zone.
    fn fake_sysfs(root: &Path) {
        let pkg0 = root.join("intel-rapl:0");
        make_zone(&pkg0, "package-0", Some("50000000\n"));
        make_zone(&pkg0.join("intel-rapl:0:0"), "core", Some("20000000\n"));
        make_zone(&pkg0.join("intel-rapl:0:1"), "dram", Some("7000000\n"));
        let pkg1 = root.join("intel-rapl:1");
        make_zone(&pkg1, "package-1", Some("30000000\n"));
        make_zone(&pkg1.join("intel-rapl:1:0"), "core", Some("10000000\n"));
        make_zone(&root.join("intel-rapl:2"), "psys", Some("99000000\n"));
        // not a zone
        fs::write(root.join("enabled"), "1\n").unwrap();
    }

    #[test]
    fn test_powercap_hierarchy() -> anyhow::Result<()> {
        let root = tempdir()?;
        fake_sysfs(root.path());

        let zones = all_power_zones(root.path())?;
        let top: Vec<&str> = zones.top.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(top, vec!["package-0", "package-1"]);
        assert_eq!(zones.flat.len(), 5);
        assert_eq!(zones.top[0].children.len(), 2);
        assert!(zones.flat.iter().filter(|z| z.name == "core").all(|z| z.domain == EnergyDomain::Core));
        let dram = zones.flat.iter().find(|z| z.name == "dram").unwrap();
        assert_eq!(dram.socket_id, 0);
        for z in zones.top {
            println!("{z}");
        }
        Ok(())
    }

    #[test]
    fn test_powercap_missing_root() {
        assert!(all_power_zones(Path::new("/this/directory/does/not/exist")).is_err());
    }

    #[test]
    fn test_powercap_energy() -> anyhow::Result<()> {
        let root = tempdir()?;
        fake_sysfs(root.path());
        let source = PowercapSource::new(root.path())?;

        assert!(source.is_system_collection_supported());
        assert_eq!(source.package_energy()?, 80000);
        assert_eq!(source.core_energy()?, 30000);
        assert_eq!(source.dram_energy()?, 7000);
        assert!(matches!(
            source.uncore_energy(),
            Err(EnergyError::UnsupportedDomain {
                domain: EnergyDomain::Uncore,
                ..
            })
        ));

        let per_package = source.absolute_energy_per_package();
        assert_eq!(
            per_package[&0],
            NodeComponentsEnergy {
                core: 20000,
                dram: 7000,
                uncore: 0,
                pkg: 50000
            }
        );
        assert_eq!(per_package[&1].pkg, 30000);
        assert_eq!(per_package[&1].dram, 0);
        Ok(())
    }

    #[test]
    fn test_powercap_unreadable_package() -> anyhow::Result<()> {
        let root = tempdir()?;
        fake_sysfs(root.path());
        let source = PowercapSource::new(root.path())?;

        fs::remove_file(root.path().join("intel-rapl:1/energy_uj"))?;
        let per_package = source.absolute_energy_per_package();
        assert_eq!(per_package.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(source.package_energy()?, 50000);

        fs::write(root.path().join("intel-rapl:0/energy_uj"), "garbage")?;
        // the file is still readable, only its content is wrong
        assert!(source.is_system_collection_supported());
        assert_eq!(source.package_energy()?, 0);
        assert!(source.absolute_energy_per_package().is_empty());
        Ok(())
    }

    #[test]
    fn test_powercap_snapshot() -> anyhow::Result<()> {
        let root = tempdir()?;
        fake_sysfs(root.path());
        let source = PowercapSource::new(root.path())?;

        let snapshot = source.energy_snapshot(&[EnergyDomain::Package, EnergyDomain::Core, EnergyDomain::Uncore]);
        assert_eq!(snapshot.totals[EnergyDomain::Package], Some(80000));
        assert_eq!(snapshot.totals[EnergyDomain::Core], Some(30000));
        assert_eq!(snapshot.totals[EnergyDomain::Uncore], None);
        assert_eq!(snapshot.totals[EnergyDomain::Dram], None);
        assert_eq!(snapshot.per_package, source.absolute_energy_per_package());
        Ok(())
    }

    #[test]
    fn test_powercap_sum_wraps_around() -> anyhow::Result<()> {
        let root = tempdir()?;
        // u64::MAX microjoules, i.e. u64::MAX / 1000 millijoules per package
        for pkg in 0..1001 {
            make_zone(
                &root.path().join(format!("intel-rapl:{pkg}")),
                &format!("package-{pkg}"),
                Some(&format!("{}\n", u64::MAX)),
            );
        }
        let source = PowercapSource::new(root.path())?;
        let expected = (0..1001).fold(0u64, |acc, _| acc.wrapping_add(u64::MAX / 1000));
        assert_eq!(source.package_energy()?, expected);
        Ok(())
    }

    #[test]
    fn test_powercap_no_package_zero() -> anyhow::Result<()> {
        let root = tempdir()?;
        make_zone(&root.path().join("intel-rapl:1"), "package-1", Some("1000\n"));
        let source = PowercapSource::new(root.path())?;
        assert!(!source.is_system_collection_supported());
        assert_eq!(source.package_energy()?, 1);
        Ok(())
    }
}
