//! Compilation settings for the circuit JIT

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::abi::LayoutRules;
use crate::error::Result;

/// Cranelift optimisation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Settings applied when a circuit is compiled.
///
/// ```toml
/// opt_level = "speed"
/// verify = true
/// layout = "natural"
/// debug_taps = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct JitConfig {
    pub opt_level: OptLevel,
    /// Run the Cranelift IR verifier on every function.
    pub verify: bool,
    /// Layout of the input, output and debug records shared with compiled code.
    pub layout: LayoutRules,
    /// Build the instrumented variant that captures instance inputs.
    pub debug_taps: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify: true,
            layout: LayoutRules::Natural,
            debug_taps: true,
        }
    }
}

impl JitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_layout(mut self, layout: LayoutRules) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_debug_taps(mut self, enabled: bool) -> Self {
        self.debug_taps = enabled;
        self
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }
}
