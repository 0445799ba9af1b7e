//! Mission runners: a single-entry-point mode and a state-machine mode
//! with init hooks, timed states and supervised background tasks, plus
//! signal-driven abort wiring.

pub mod runner;
pub mod supervisor;

pub use runner::{run_mission, MissionError, StateMachine, StateMachineBuilder, Transition};
pub use supervisor::{supervise, MissionOutcome};
