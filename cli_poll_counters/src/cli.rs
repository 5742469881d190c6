use std::{fmt::Display, path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand, ValueEnum};
use rapl_counters::{layout, EnergyDomain};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    /// Where to read the energy counters from.
    #[arg(short, long, default_value_t = SourceType::Scaphandre)]
    pub source: SourceType,

    /// Directory that contains the `intel-rapl:<n>` zones.
    /// Defaults to /var/scaphandre or /sys/class/powercap/intel-rapl, depending on the source.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// How many packages to probe (scaphandre source only).
    #[arg(long, default_value_t = layout::DEFAULT_NUM_PACKAGES)]
    pub packages: u32,

    /// Name of the counter file in each package directory (scaphandre source only).
    #[arg(long, default_value = layout::ENERGY_FILE)]
    pub energy_file: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the energy source and the current counters, then exit.
    Info,

    /// Poll the energy counters continuously
    Poll {
        /// The energy domains to record. Defaults to all the domains supported by the source.
        #[arg(short, long, value_delimiter = ',')]
        domains: Vec<EnergyDomain>,

        /// Measurement frequency, in Hertz. Zero stops immediately, a negative value polls continuously.
        #[arg(short, long, allow_negative_numbers = true)]
        frequency: f64,

        /// Print energy measurements on each iteration.
        #[arg(short, long, value_enum)]
        output: OutputType,

        /// Sets the output file, if output if set to file.
        #[arg(long)]
        output_file: Option<String>,
    },
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Stdout,
    File,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceType {
    Scaphandre,
    Powercap,
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            SourceType::Scaphandre => "scaphandre",
            SourceType::Powercap => "powercap",
        };
        f.write_str(str)
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaphandre" | "rapl-sysfs-scaphandre" => Ok(SourceType::Scaphandre),
            "powercap" | "powercap-sysfs" | "rapl-sysfs" => Ok(SourceType::Powercap),
            _ => Err(format!("unknown energy source '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rapl_counters::EnergyDomain;

    use super::{Cli, Commands, OutputType, SourceType};

    #[test]
    fn test_parse_poll() {
        let cli = Cli::try_parse_from([
            "cli_poll_counters",
            "--source",
            "powercap",
            "poll",
            "-f",
            "10",
            "-o",
            "stdout",
            "-d",
            "package,dram",
        ])
        .unwrap();
        assert_eq!(cli.source, SourceType::Powercap);
        assert_eq!(cli.packages, 64);
        assert_eq!(cli.energy_file, "energy_uj");
        match cli.command {
            Commands::Poll {
                domains,
                frequency,
                output,
                output_file,
            } => {
                assert_eq!(domains, vec![EnergyDomain::Package, EnergyDomain::Dram]);
                assert_eq!(frequency, 10.0);
                assert_eq!(output, OutputType::Stdout);
                assert_eq!(output_file, None);
            }
            Commands::Info => panic!("expected poll"),
        }
    }

    #[test]
    fn test_parse_info_defaults() {
        let cli = Cli::try_parse_from(["cli_poll_counters", "--packages", "2", "info"]).unwrap();
        assert_eq!(cli.source, SourceType::Scaphandre);
        assert_eq!(cli.packages, 2);
        assert!(cli.root.is_none());
        assert!(matches!(cli.command, Commands::Info));
    }

    #[test]
    fn test_unknown_source() {
        assert!("msr".parse::<SourceType>().is_err());
        assert_eq!("rapl-sysfs".parse::<SourceType>(), Ok(SourceType::Powercap));
    }
}
