// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::time::Instant;
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};

use dapqueue::probe::{Probe, ProbeInfo};
use dapqueue::dap::{DAP, Mode, ResetKind};
use dapqueue::{jtag, Port};

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("dapqueue")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("probe")
             .help("VID:PID[:SN] of CMSIS-DAP device to use")
             .long("probe")
             .short('p')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("freq")
             .help("Clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("1M")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("ir-lengths")
             .help("Lengths of each IR, starting from TAP 0 closest to TDO, comma-separated")
             .long("ir-lengths")
             .short('i')
             .action(ArgAction::Set)
             .value_delimiter(',')
             .default_value("4")
             .value_parser(value_parser!(u8))
             .global(true))
        .arg(Arg::new("tap")
             .help("TAP position of the debug port in the scan chain (0-indexed)")
             .long("tap")
             .short('t')
             .action(ArgAction::Set)
             .default_value("0")
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("swd")
             .help("Use SWD instead of JTAG for register access")
             .long("swd")
             .action(ArgAction::SetTrue)
             .global(true))
        .subcommand(Command::new("probes")
            .about("List available CMSIS-DAP probes"))
        .subcommand(Command::new("scan")
            .about("Scan JTAG chain and print IDCODEs"))
        .subcommand(Command::new("reset")
            .about("Pulse the nRESET line for 100ms"))
        .subcommand(Command::new("dpidr")
            .about("Read the debug port IDCODE register"))
        .subcommand(Command::new("read")
            .about("Read a DP or AP register")
            .arg(Arg::new("ap")
                 .help("Read from the access port instead of the debug port")
                 .long("ap")
                 .action(ArgAction::SetTrue))
            .arg(Arg::new("address")
                 .help("Register address (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<u8>)))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing probes does not require first connecting to a probe,
    // so we just list them and quit early.
    if matches.subcommand_name() == Some("probes") {
        print_probe_list();
        return Ok(());
    }

    // All functions after this point require an open probe, so
    // we now attempt to connect to the specified probe.
    let probe = if let Some(probe) = matches.get_one::<String>("probe") {
        ProbeInfo::from_specifier(probe)?.open()?
    } else {
        Probe::new()?
    };
    let mut dap = DAP::new(probe)?;

    // At this point we can handle the reset command.
    if matches.subcommand_name() == Some("reset") {
        if !quiet { println!("Pulsing nRESET line.") };
        dap.reset(ResetKind::System)?;
        return Ok(());
    }

    if let Some(&freq) = matches.get_one::<u32>("freq") {
        dap.set_clock(freq)?;
    }

    if matches.get_flag("swd") {
        dap.set_transfer_mode(Mode::SWD)?;
    } else {
        if dap.mode() != Some(Mode::JTAG) {
            dap.set_transfer_mode(Mode::JTAG)?;
        }
        let ir_lengths: Vec<u8> = matches.get_many::<u8>("ir-lengths")
                                         .map(|lens| lens.copied().collect())
                                         .unwrap_or_default();
        dap.configure_jtag(&ir_lengths)?;
        if let Some(&tap) = matches.get_one::<usize>("tap") {
            dap.set_tap_index(tap)?;
        }
    }

    match matches.subcommand() {
        Some(("scan", _)) => {
            let idcodes = jtag::idcodes(&dap)?;
            println!("Detected JTAG chain, closest to TDO first:");
            for (idx, idcode) in idcodes.iter().enumerate() {
                match idcode {
                    Some(idcode) => println!(" - {}: IDCODE 0x{:08X}", idx, idcode),
                    None => println!(" - {}: BYPASS", idx),
                }
            }
        },
        Some(("dpidr", _)) => {
            let value = read_register(&dap, Port::DP, 0x0)?;
            println!("DPIDR: 0x{:08X}", value);
        },
        Some(("read", matches)) => {
            let port = if matches.get_flag("ap") { Port::AP } else { Port::DP };
            let address = *matches.get_one::<u8>("address").ok_or_else(
                || anyhow::anyhow!("Missing register address"))?;
            let value = read_register(&dap, port, address)?;
            println!("{:?} 0x{:02X}: 0x{:08X}", port, address, value);
        },
        _ => anyhow::bail!("Unhandled command."),
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

fn read_register(dap: &DAP<Probe>, port: Port, address: u8) -> anyhow::Result<u32> {
    let mut value = 0;
    {
        let mut regs = dap.registers()?;
        regs.single_read(port, address, &mut value)?;
        regs.commit()?;
    }
    Ok(value)
}

fn print_probe_list() {
    let probes = ProbeInfo::list();
    if probes.is_empty() {
        println!("No CMSIS-DAP probes found.");
    } else {
        println!("Found {} CMSIS-DAP probe{}:", probes.len(),
                 if probes.len() == 1 { "" } else { "s" });
        for probe in probes {
            println!("  {}", probe);
        }
    }
}
