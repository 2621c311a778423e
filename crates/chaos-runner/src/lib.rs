//! # chaos-runner
//!
//! Discrete-event simulator for networks of Chaos nodes.
//!
//! Every node runs the unmodified [`chaos_core::RoundScheduler`] against a
//! simulated radio and a drifting two-resolution clock. Frames travel over a
//! shared [`Medium`] that models per-link reception ratios, constructive
//! interference of identical concurrent frames, the capture effect and
//! half-duplex radios.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`clock`] | Per-node drifting clock |
//! | [`medium`] | Shared wireless channel |
//! | [`hardware`] | `Radio`/`Clock`/`RoundTimer` implementations |
//! | [`topology`] | YAML topology files |
//! | [`simulation`] | Event queue and statistics |
//! | [`error`] | Error types |
//!
//! ## Example
//!
//! ```no_run
//! use chaos_runner::{run, Topology};
//!
//! let topology = Topology::load("topologies/mesh.yaml")?;
//! let stats = run(&topology, 30.0, 7)?;
//! println!("{}", stats);
//! # Ok::<(), chaos_runner::RunnerError>(())
//! ```

pub mod clock;
pub mod error;
pub mod hardware;
pub mod medium;
pub mod simulation;
pub mod topology;

pub use clock::{NodeClock, HI_TICKS_PER_SECOND};
pub use error::{RunnerError, TopologyError};
pub use hardware::{HwAction, RoundAlarm, SimHardware, TimingModel};
pub use medium::{Medium, MediumConfig, MediumCounters, RadioMode};
pub use simulation::{NodeStats, Simulation, SimulationStats};
pub use topology::{LinkSpec, NodeSpec, Topology};

/// Simulate `topology` for `seconds` of simulation time.
pub fn run(topology: &Topology, seconds: f64, seed: u64) -> Result<SimulationStats, RunnerError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(RunnerError::InvalidDuration(seconds));
    }
    let mut simulation = Simulation::build(topology, seed)?;
    simulation.run_for(seconds)?;
    Ok(simulation.into_stats())
}
