use std::path::Path;
use std::time::Duration;

use clap::{ArgAction, Parser};

use flowsync_lib::config::{self, Config};
use flowsync_lib::rt_names::RtNames;

/// Synchronize a kernel routing table into a tc-flower offload pipeline
/// on a capable NIC.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Install offload rules on this interface
    #[arg(short, long)]
    pub iface: String,

    /// Routing table to synchronize with (name or numeric id)
    #[arg(short, long)]
    pub table: String,

    /// Add a static prefix to a named list
    #[arg(
        short = 'p',
        long,
        num_args = 2,
        value_names = ["LIST", "PREFIX"],
        action = ArgAction::Append
    )]
    pub add_prefix: Vec<String>,

    /// Load static prefixes for a named list from a file
    #[arg(
        short = 'P',
        long,
        num_args = 2,
        value_names = ["LIST", "FILE"],
        action = ArgAction::Append
    )]
    pub load_prefix: Vec<String>,

    /// Seconds between netlink scans
    #[arg(short = 's', long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub scan_interval: u64,

    /// Run for this many seconds, then exit
    #[arg(short = 'T', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Just sync once, then exit
    #[arg(short = '1', long)]
    pub one_off: bool,

    /// Don't make any changes to TC
    #[arg(long)]
    pub dry_run: bool,

    /// For testing without offload-capable hardware
    #[arg(long)]
    pub skip_hw: bool,

    /// Increase verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn resolve_table(table: &str) -> Result<u32, String> {
    if let Some(id) = RtNames::load().lookup(table) {
        return Ok(id);
    }
    match table.parse::<u32>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(format!("unknown routing table `{table}`")),
    }
}

pub fn build_config(cli: &Cli) -> Result<Config, String> {
    let ifindex = config::resolve_ifindex(&cli.iface)
        .ok_or_else(|| format!("invalid interface `{}`", cli.iface))?;
    let table_id = resolve_table(&cli.table)?;

    let mut cfg = Config::new(cli.iface.clone(), ifindex, table_id);
    cfg.scan_interval = Duration::from_secs(cli.scan_interval);
    cfg.timeout = cli.timeout.map(Duration::from_secs);
    cfg.one_off = cli.one_off;
    cfg.dry_run = cli.dry_run;
    if cli.skip_hw {
        cfg.flower_flags = flowsync_lib::wire::TCA_CLS_FLAGS_SKIP_HW;
    }

    for pair in cli.add_prefix.chunks(2) {
        let [list, prefix] = pair else {
            return Err("--add-prefix takes two arguments".to_string());
        };
        cfg.prefix_lists
            .add_prefix(list, prefix)
            .map_err(|e| e.to_string())?;
    }
    for pair in cli.load_prefix.chunks(2) {
        let [list, file] = pair else {
            return Err("--load-prefix takes two arguments".to_string());
        };
        cfg.prefix_lists
            .load_file(list, Path::new(file))
            .map_err(|e| e.to_string())?;
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["flowsync", "--iface", "lo", "--table", "main"]
    }

    #[test]
    fn parses_minimum_arguments() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(base_args())?;
        assert_eq!(cli.iface, "lo");
        assert_eq!(cli.table, "main");
        assert_eq!(cli.scan_interval, 10);
        assert!(!cli.one_off);
        Ok(())
    }

    #[test]
    fn missing_iface_is_rejected() {
        assert!(Cli::try_parse_from(["flowsync", "--table", "main"]).is_err());
    }

    #[test]
    fn prefix_arguments_come_in_pairs() -> anyhow::Result<()> {
        let mut args = base_args();
        args.extend(["-p", "onload", "192.0.2.0/24", "-p", "onload", "2001:db8::/48"]);
        let cli = Cli::try_parse_from(args)?;
        assert_eq!(cli.add_prefix.len(), 4);

        let cfg = build_config(&cli).map_err(anyhow::Error::msg)?;
        let list = cfg.prefix_lists.lookup("onload").expect("list");
        assert_eq!(list.prefixes.len(), 2);
        Ok(())
    }

    #[test]
    fn verbosity_accumulates() -> anyhow::Result<()> {
        let mut args = base_args();
        args.extend(["-v", "--verbose"]);
        let cli = Cli::try_parse_from(args)?;
        assert_eq!(cli.verbose, 2);
        Ok(())
    }

    #[test]
    fn numeric_tables_resolve() {
        assert_eq!(resolve_table("main"), Ok(254));
        assert_eq!(resolve_table("100"), Ok(100));
        assert!(resolve_table("0").is_err());
        assert!(resolve_table("bogus").is_err());
    }

    #[test]
    fn zero_scan_interval_is_rejected() {
        let mut args = base_args();
        args.extend(["--scan-interval", "0"]);
        assert!(Cli::try_parse_from(args).is_err());
    }
}
