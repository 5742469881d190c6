use std::{collections::BTreeMap, fs, path::Path};

use rapl_counters::{
    powercap::PowercapSource, scaphandre::ScaphandreSource, CounterLayout, EnergyDomain, EnergyError, EnergySource,
};
use tempfile::tempdir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Queries a source the way a polling pipeline would.
fn collect(source: &dyn EnergySource) -> (BTreeMap<EnergyDomain, Option<u64>>, u64) {
    let mut per_domain = BTreeMap::new();
    for domain in EnergyDomain::ALL {
        let value = match source.absolute_energy(domain) {
            Ok(v) => Some(v),
            Err(EnergyError::UnsupportedDomain { .. }) => None,
        };
        per_domain.insert(domain, value);
    }
    let pkg_sum = source.absolute_energy_per_package().values().map(|e| e.pkg).sum();
    (per_domain, pkg_sum)
}

#[test]
fn scaphandre_mirror() -> anyhow::Result<()> {
    init_logger();
    let root = tempdir()?;
    let layout = CounterLayout::scaphandre().with_root(root.path()).with_num_packages(4);
    write_file(&layout.counter_path(0), "45000000\n");
    write_file(&layout.counter_path(1), "abc");
    write_file(&layout.counter_path(2), "9000000\n");

    let mut source: Box<dyn EnergySource> = Box::new(ScaphandreSource::new(layout));
    assert_eq!(source.name(), "rapl-sysfs-scaphandre");
    assert!(source.is_system_collection_supported());

    let (per_domain, pkg_sum) = collect(source.as_ref());
    assert_eq!(per_domain[&EnergyDomain::Package], Some(54000));
    assert_eq!(per_domain[&EnergyDomain::Uncore], Some(54000));
    assert_eq!(per_domain[&EnergyDomain::Core], None);
    assert_eq!(per_domain[&EnergyDomain::Dram], None);
    assert_eq!(pkg_sum, 54000);

    source.stop();
    Ok(())
}

#[test]
fn powercap_sysfs() -> anyhow::Result<()> {
    init_logger();
    let root = tempdir()?;
    write_file(&root.path().join("intel-rapl:0/name"), "package-0\n");
    write_file(&root.path().join("intel-rapl:0/energy_uj"), "12000000\n");
    write_file(&root.path().join("intel-rapl:0/intel-rapl:0:0/name"), "core\n");
    write_file(&root.path().join("intel-rapl:0/intel-rapl:0:0/energy_uj"), "4000000\n");
    write_file(&root.path().join("intel-rapl:0/intel-rapl:0:1/name"), "uncore\n");
    write_file(&root.path().join("intel-rapl:0/intel-rapl:0:1/energy_uj"), "1000000\n");

    let source: Box<dyn EnergySource> = Box::new(PowercapSource::new(root.path())?);
    assert_eq!(source.name(), "rapl-sysfs");
    assert!(source.is_system_collection_supported());

    let (per_domain, pkg_sum) = collect(source.as_ref());
    assert_eq!(per_domain[&EnergyDomain::Package], Some(12000));
    assert_eq!(per_domain[&EnergyDomain::Core], Some(4000));
    assert_eq!(per_domain[&EnergyDomain::Uncore], Some(1000));
    assert_eq!(per_domain[&EnergyDomain::Dram], None);
    assert_eq!(pkg_sum, 12000);
    Ok(())
}

#[test]
fn sources_are_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ScaphandreSource>();
    assert_send_sync::<PowercapSource>();
}
