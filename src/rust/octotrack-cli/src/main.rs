// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Command line front end of the measurement rig.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::{Delay, I2cdev};
use octotrack::{DataLogger, MeasurementConfig, MeasurementEngine, MemorySink, PassReport};
use octotrack_hw::sim::{SimBus, SimCell, SimDelay};
use octotrack_hw::{BoardRegistry, Bus, HardwareConfig};
use octotrack_log::{info, warn};

/// Voltage applied to every cell before the first tracking pass.
const START_VOLTAGE: f64 = 0.5;

#[derive(Parser, Debug)]
#[command(name = "octotrack", version, about = "Maximum power point tracking of photovoltaic test cells")]
struct Cli {
    /// Linux I2C bus number, the rig is on `/dev/i2c-<BUS>`.
    #[arg(long, default_value_t = 1, global = true)]
    bus: u8,

    /// Run against a simulated rig instead of the hardware.
    #[arg(long, global = true)]
    simulate: bool,

    /// Raise the log level, repeat for more.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log every sweep point and tracking step.
    #[arg(long, global = true)]
    diagnostics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the boards behind the given bus-switch channels.
    Scan {
        #[arg(long, value_delimiter = ',', default_value = "0")]
        switch_channels: Vec<u8>,
        /// Take the hardware settings from this measurement file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Track all active cells.
    Track {
        #[arg(long)]
        config: PathBuf,
        /// Number of passes, 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        passes: usize,
    },
    /// Apply one voltage to every active cell.
    SetVoltage {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        voltage: f64,
    },
    /// Run a JV sweep on one cell and print its maximum power point.
    Sweep {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        cell: String,
    },
    /// Toggle cells between 2 V and 0 V to locate them.
    Blink {
        #[arg(long)]
        config: PathBuf,
        #[arg(long = "cell", required = true, num_args = 1..)]
        cells: Vec<String>,
        #[arg(long, default_value_t = 2)]
        cycles: usize,
    },
}

impl Command {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Command::Scan { config, .. } => config.as_deref(),
            Command::Track { config, .. }
            | Command::SetVoltage { config, .. }
            | Command::Sweep { config, .. }
            | Command::Blink { config, .. } => Some(config),
        }
    }
}

fn init_logger(verbose: u8, diagnostics: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    octotrack_log::init_logging(diagnostics);
}

fn load_config(path: Option<&Path>) -> Result<Option<MeasurementConfig>> {
    path.map(|path| {
        MeasurementConfig::load(path)
            .with_context(|| format!("Failed to load measurement file {}", path.display()))
    })
    .transpose()
}

fn required(config: Option<MeasurementConfig>) -> Result<MeasurementConfig> {
    match config {
        Some(config) => Ok(config),
        None => bail!("This command needs a measurement file"),
    }
}

/// Rig with a board and a generic cell behind every configured route.
fn simulated_rig(command: &Command, config: Option<&MeasurementConfig>) -> SimBus {
    let sim = SimBus::new();
    if let Command::Scan {
        switch_channels, ..
    } = command
    {
        for &switch_channel in switch_channels {
            sim.add_board(switch_channel, 0);
        }
    }
    for cell in config.iter().flat_map(|config| &config.cells) {
        sim.add_board(cell.route.switch_channel, cell.route.board);
        sim.attach_cell(cell.route, SimCell::photovoltaic(0.02, 0.6));
    }
    sim
}

fn print_report(action: &str, report: &PassReport) {
    println!("{action}: {} cell(s) done", report.completed.len());
    for (cell_id, err) in &report.failed {
        println!("  cell {cell_id} failed: {err}");
    }
}

fn run<I: I2c, D: DelayNs>(
    bus: Bus<I, D>,
    command: Command,
    config: Option<MeasurementConfig>,
) -> Result<()> {
    match command {
        Command::Scan {
            switch_channels, ..
        } => {
            let hardware = config.map(|config| config.hardware).unwrap_or_default();
            scan(bus, switch_channels, &hardware)
        }
        Command::Track { passes, .. } => {
            let config = required(config)?;
            let logger = DataLogger::new(config.local_folder.clone(), config.network_folder.clone());
            let mut engine = MeasurementEngine::initialize(bus, &config, logger)?;
            print_report("Start voltage", &engine.set_all_cells_to_voltage(&config, START_VOLTAGE));
            let mut pass = 0;
            while passes == 0 || pass < passes {
                let report = engine.track_all(&config);
                pass += 1;
                info!(
                    "Pass {} tracked {} cell(s), {} failed",
                    pass,
                    report.completed.len(),
                    report.failed.len()
                );
            }
            Ok(())
        }
        Command::SetVoltage { voltage, .. } => {
            let config = required(config)?;
            let mut engine = MeasurementEngine::initialize(bus, &config, MemorySink::default())?;
            print_report("Set voltage", &engine.set_all_cells_to_voltage(&config, voltage));
            Ok(())
        }
        Command::Sweep { cell, .. } => {
            let config = required(config)?;
            let logger = DataLogger::new(config.local_folder.clone(), config.network_folder.clone());
            let mut engine = MeasurementEngine::initialize(bus, &config, logger)?;
            let (result, mpp) = engine.sweep_cell(&config, &cell)?;
            if result.is_truncated() {
                warn!("Sweep of cell {} was cut short by the current limit", cell);
            }
            match mpp {
                Some(mpp) => println!(
                    "Cell {cell}: {:.4} W at {:.4} V, {:.6} A (set {:.4} V)",
                    mpp.power(),
                    mpp.measured_voltage,
                    mpp.measured_current,
                    mpp.set_voltage
                ),
                None => println!("Cell {cell}: no samples"),
            }
            if let Some(voc) = result.voc() {
                println!("Cell {cell}: open-circuit voltage {voc:.4} V");
            }
            Ok(())
        }
        Command::Blink { cells, cycles, .. } => {
            let config = required(config)?;
            let mut engine = MeasurementEngine::initialize(bus, &config, MemorySink::default())?;
            print_report("Blink", &engine.blink(&config, &cells, cycles));
            Ok(())
        }
    }
}

fn scan<I: I2c, D: DelayNs>(
    bus: Bus<I, D>,
    switch_channels: Vec<u8>,
    hardware: &HardwareConfig,
) -> Result<()> {
    let mut bus = bus.with_switch_settle(hardware.switch_settle());
    let registry = BoardRegistry::initialize(&mut bus, switch_channels, hardware)
        .context("Board discovery failed")?;
    if registry.is_empty() {
        println!("No boards found");
    }
    for (switch_channel, board) in registry.iter() {
        println!(
            "Switch channel {switch_channel}: {} at offset {}, addresses {:?}",
            board.id(),
            board.offset(),
            board.addresses().all()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.diagnostics);
    let config = load_config(cli.command.config_path())?;

    if cli.simulate {
        let sim = simulated_rig(&cli.command, config.as_ref());
        run(Bus::new(sim, SimDelay::default()), cli.command, config)
    } else {
        let path = format!("/dev/i2c-{}", cli.bus);
        let i2c = I2cdev::new(&path).with_context(|| format!("Failed to open {path}"))?;
        run(Bus::new(i2c, Delay), cli.command, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blink() {
        let cli = Cli::try_parse_from([
            "octotrack", "--simulate", "blink", "--config", "m.json", "--cell", "3", "4",
        ])
        .unwrap();
        assert!(cli.simulate);
        match cli.command {
            Command::Blink { cells, cycles, .. } => {
                assert_eq!(cells, vec!["3", "4"]);
                assert_eq!(cycles, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_negative_voltage() {
        let cli =
            Cli::try_parse_from(["octotrack", "set-voltage", "--config", "m.json", "--voltage", "-0.2"])
                .unwrap();
        assert!(matches!(cli.command, Command::SetVoltage { voltage, .. } if voltage == -0.2));
    }

    #[test]
    fn test_scan_simulated_rig() {
        let command = Command::Scan {
            switch_channels: vec![0, 2],
            config: None,
        };
        let sim = simulated_rig(&command, None);
        let mut bus = Bus::new(sim, SimDelay::default());
        let registry = BoardRegistry::initialize(&mut bus, [0, 2], &HardwareConfig::default()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_commands_need_config() {
        assert!(required(None).is_err());
    }
}
