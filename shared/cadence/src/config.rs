//! Configuration surface of the cadence controller, loadable from TOML,
//! with a `#[serde(default = "...")]` per field rather than a single
//! blanket `#[serde(default)]` on the struct so each default is documented
//! next to the field it applies to.

use serde::Deserialize;

/// Which reduced-precision type the global sync downcasts parameters to
/// while `g < 1` (the cast is active during cycling, never during warmup or
/// cooldown, which always use `g = 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DowncastType {
    Half,
    Bfloat16,
}

impl Default for DowncastType {
    fn default() -> Self {
        DowncastType::Bfloat16
    }
}

fn default_warmup_epochs() -> u32 {
    4
}

fn default_cooldown_epochs() -> u32 {
    4
}

fn default_stability_level() -> f64 {
    0.05
}

fn default_max_global_skips() -> u32 {
    8
}

fn default_sending_chunk_size() -> usize {
    10_000_000
}

fn default_downcast_type() -> DowncastType {
    DowncastType::Bfloat16
}

fn default_use_mpi_groups() -> bool {
    true
}

fn default_verbose() -> bool {
    false
}

/// `local_optimizer`, `scheduler`, and any gradient scaler are runtime
/// hooks, not serializable config: they're opaque trait objects bound via
/// `CadenceController::set_model`/`add_scaler`, not TOML values.
#[derive(Debug, Clone, Deserialize)]
pub struct CadenceConfig {
    pub total_epochs: u32,

    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: u32,

    #[serde(default = "default_cooldown_epochs")]
    pub cooldown_epochs: u32,

    #[serde(default = "default_stability_level")]
    pub stability_level: f64,

    #[serde(default = "default_max_global_skips")]
    pub max_global_skips: u32,

    #[serde(default = "default_sending_chunk_size")]
    pub sending_chunk_size: usize,

    #[serde(default = "default_downcast_type")]
    pub downcast_type: DowncastType,

    #[serde(default = "default_use_mpi_groups")]
    pub use_mpi_groups: bool,

    #[serde(default = "default_verbose")]
    pub verbose: bool,
}

impl CadenceConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
