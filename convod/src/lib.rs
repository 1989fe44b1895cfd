pub mod config;
pub mod daemon;
pub mod shaper;
pub mod sync;
pub mod tools;
