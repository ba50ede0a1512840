//! Shoal process entry points and the interactive peer console.

pub mod cli;
