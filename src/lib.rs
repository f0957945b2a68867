//! # NOMIC Nulling Operations Library
//!
//! Operating procedures for the NOMIC nulling-interferometer camera and the
//! PHASECAM phase loop, written against a property-based device-control
//! server. The library is shared by the `nomic-ops` CLI and the integration
//! tests, which run everything against the in-process simulator.
//!
//! ## Crate Structure
//!
//! - **`config`**: Observing configuration loaded with `figment` from
//!   `config/nomic_ops.toml` and `NOMIC_OPS_*` environment variables.
//! - **`device`**: The property model (`PropertyPath`, `PropertyValue`,
//!   `PropertyUpdate`), the `PropertyClient` trait, the capability traits
//!   procedures are written against, and the simulated server.
//! - **`error`**: The `NomicError` enum for failures procedures react to.
//! - **`instruments`**: Adapters implementing the capabilities over a
//!   `PropertyClient` (phase loop controller, NOMIC camera, telescope).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`numeric`**: Parabola fitting and sample statistics.
//! - **`procedures`**: The procedure lifecycle and the operating procedures:
//!   setpoint search, acquisitions, nods, loop waits, OPD dither and the full
//!   nulling sequence.

pub mod config;
pub mod device;
pub mod error;
pub mod instruments;
pub mod logging;
pub mod numeric;
pub mod procedures;
