//! Vehicle control core: the high-level command surface, the command
//! handle lifecycle, and the typed error taxonomy.

mod commands;
pub mod error;
pub mod events;
pub mod handle;
pub mod vehicle;

pub use error::VehicleError;
pub use events::VehicleEvent;
pub use handle::{CommandHandle, CommandResult, CommandStatus};
pub use vehicle::{
    ArmOptions, BatteryStatus, GotoOptions, OrbitOptions, SetVelocityOptions, Vehicle,
    VehicleOptions, DEFAULT_GOTO_TIMEOUT, DEFAULT_GOTO_TOLERANCE_M,
};

// The safety vocabulary travels with the vehicle API.
pub use skyhook_safety::{SafetyLimits, VehicleType};
