//! Shoal Core — ambient plumbing shared by the coordinator and peer binaries.

pub mod logging;
pub mod paths;
