//! bridgelink library — exposes all modules for use as a library dependency.

pub mod bind;
pub mod container;
pub mod probe;
pub mod qr;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod verify;
