//! Types shared by the drain engine and its front ends.
pub mod constants;
pub mod nodegroup;
pub mod telemetry;
