//! Thin re-export: the scheduling kernel owns every tunable this process
//! needs, so the binary doesn't carry a second config struct.

pub use crawld_core::config::Config;
