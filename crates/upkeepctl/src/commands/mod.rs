//! Command implementations

pub mod daemon;
pub mod run;
pub mod status;
pub mod update;
pub mod version_check;
