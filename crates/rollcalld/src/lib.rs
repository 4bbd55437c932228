//! rollcalld: attendance daemon internals.
//!
//! The [`coordinator::Coordinator`] owns the camera session and runs the
//! acquisition loop; [`dbus_interface::AttendanceService`] exposes its control
//! operations on the session bus.

pub mod attendance;
pub mod config;
pub mod coordinator;
pub mod dbus_interface;
pub mod report;
