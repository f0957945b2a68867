//! CLI Entry Point for nomic-ops
//!
//! Runs the operating procedures against the simulated device server:
//! - `setpoint`: iterative OPD setpoint search
//! - `acquire <kind>`: darks, nulls, photometry or backgrounds
//! - `nod <up|down>`: telescope nod with PHASECAM and ROI follow-up
//! - `observe`: the full nulling sequence
//! - `show-config`: print the effective configuration
//! - `list`: describe the available procedures
//!
//! # Usage
//!
//! ```bash
//! nomic-ops setpoint --initial 120
//! nomic-ops acquire null --frames 200
//! nomic-ops --json nod up
//! NOMIC_OPS_SETPOINT__N_IMG=5 nomic-ops setpoint
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use nomic_ops::config::ObservingConfig;
use nomic_ops::device::capabilities::TelescopeSide;
use nomic_ops::device::simulated::SimulatedServer;
use nomic_ops::instruments::DeviceSet;
use nomic_ops::logging;
use nomic_ops::procedures::acquisition::{Acquisition, AcquisitionKind};
use nomic_ops::procedures::nod::{BackgroundOffset, Nod, NodDirection};
use nomic_ops::procedures::sequence::NullingSequence;
use nomic_ops::procedures::setpoint_search::SetpointSearch;
use nomic_ops::procedures::{
    execute_procedure_safely, EmergencyStopFlag, Procedure, ProcedureContext, ProcedureResult,
    ProcedureTypeInfo,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nomic-ops")]
#[command(
    about = "NOMIC nulling operations against the simulated device server",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = nomic_ops::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print the procedure result as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the OPD setpoint of the deepest null
    Setpoint {
        /// Start the scan here instead of at the current setpoint (deg)
        #[arg(long, allow_hyphen_values = true)]
        initial: Option<f64>,
    },

    /// Take darks, nulls, photometry or backgrounds
    Acquire {
        /// dark, null, photometry or background
        kind: AcquisitionKind,

        /// Override the configured number of frames
        #[arg(long)]
        frames: Option<u32>,

        /// Do not dither the OPD during nulls
        #[arg(long)]
        no_dither: bool,
    },

    /// Nod the telescope
    Nod {
        /// up or down
        direction: NodDirection,

        /// Move one side only (left or right)
        #[arg(long)]
        side: Option<String>,

        /// Only move PHASECAM and the ROIs
        #[arg(long)]
        no_telescope: bool,

        /// Offset off source for a background instead of nodding
        #[arg(long)]
        background: bool,
    },

    /// Run the full nulling sequence
    Observe,

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Describe the available procedures
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ObservingConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    let server = Arc::new(SimulatedServer::new(config.simulator.clone()));
    let devices = DeviceSet::from_client(server, config.setpoint.pzt);

    let mut procedure: Box<dyn Procedure> = match cli.command {
        Commands::Setpoint { initial } => {
            let search = SetpointSearch::new(config.setpoint.clone());
            Box::new(match initial {
                Some(setpoint) => search.with_initial_setpoint(setpoint),
                None => search,
            })
        }
        Commands::Acquire {
            kind,
            frames,
            no_dither,
        } => {
            let mut acquisition = Acquisition::new(kind, config.camera.clone());
            if let Some(frames) = frames {
                acquisition = acquisition.with_frames(frames);
            }
            if !no_dither {
                acquisition = acquisition.with_dither(config.dither.clone());
            }
            Box::new(acquisition)
        }
        Commands::Nod {
            direction,
            side,
            no_telescope,
            background,
        } => {
            if background {
                Box::new(BackgroundOffset::new(
                    direction,
                    config.telescope.clone(),
                    config.camera.clone(),
                ))
            } else {
                let mut nod = Nod::new(direction, config.telescope.clone(), config.camera.clone());
                if let Some(side) = side {
                    nod = nod.with_side(parse_side(&side)?);
                }
                if no_telescope {
                    nod = nod.without_telescope();
                }
                Box::new(nod)
            }
        }
        Commands::Observe => Box::new(NullingSequence::new(config.clone())),
        Commands::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::List => {
            for info in procedure_catalog() {
                println!("{:<18} {}", info.type_id, info.description);
                println!("{:<18} uses {}", "", info.capabilities.join(", "));
            }
            return Ok(());
        }
    };

    let execution_id = Uuid::new_v4().to_string();
    let (ctx, mut progress, cancel) = ProcedureContext::new(execution_id.clone(), devices);
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            debug!(
                step = %p.step_name,
                fraction = p.fraction(),
                "{}",
                p.message
            );
        }
    });
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new()).await;
    ctrl_c.abort();
    reporter.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("{} failed: {:#}", procedure.type_id(), e);
            ProcedureResult::failure(procedure.type_id(), execution_id, format!("{:#}", e))
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.summary());
        for (key, value) in &result.data {
            if let nomic_ops::procedures::ResultValue::Json(_) = value {
                continue;
            }
            println!("  {:<32} {}", key, serde_json::to_string(value)?);
        }
        for warning in &result.warnings {
            println!("  warning: {}", warning);
        }
    }

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn procedure_catalog() -> Vec<ProcedureTypeInfo> {
    vec![
        SetpointSearch::type_info(),
        Acquisition::type_info(),
        Nod::type_info(),
        BackgroundOffset::type_info(),
        NullingSequence::type_info(),
    ]
}

fn parse_side(side: &str) -> Result<TelescopeSide> {
    match side.to_lowercase().as_str() {
        "both" => Ok(TelescopeSide::Both),
        "left" => Ok(TelescopeSide::Left),
        "right" => Ok(TelescopeSide::Right),
        other => anyhow::bail!("unknown side '{}': expected both, left or right", other),
    }
}
