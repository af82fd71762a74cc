//! Error taxonomy for circuit compilation and simulation

use thiserror::Error;

/// Coarse classification of a [`JitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The circuit cannot be compiled.
    Build,
    /// The caller broke the simulator's usage contract; the simulator is still usable.
    Usage,
    /// Internal inconsistency between host buffers and compiled code.
    Runtime,
}

#[derive(Debug, Error)]
pub enum JitError {
    #[error("unknown primitive kind `{kind}` (instance `{instance}`)")]
    UnknownPrimitive { kind: String, instance: String },

    #[error("primitive `{kind}` (instance `{instance}`) is missing generator argument `{arg}`")]
    MissingArgument {
        kind: String,
        instance: String,
        arg: String,
    },

    #[error("primitive `{kind}` (instance `{instance}`) has invalid generator argument `{arg}`: {reason}")]
    InvalidArgument {
        kind: String,
        instance: String,
        arg: String,
        reason: String,
    },

    #[error("unsupported width {width} for {what}")]
    UnsupportedWidth { what: String, width: u64 },

    #[error("unknown definition `{0}`")]
    UnknownDefinition(String),

    #[error("invalid circuit: {0}")]
    InvalidCircuit(String),

    #[error("unknown pin `{pin}` in definition `{definition}`")]
    UnknownPin { definition: String, pin: String },

    #[error("pin `{0}` has more than one driver")]
    MultipleDrivers(String),

    #[error("pin `{0}` is not driven")]
    UndrivenPin(String),

    #[error("net `{from}` -> `{to}` connects a {from_width}-bit source to a {to_width}-bit sink")]
    NetWidthMismatch {
        from: String,
        to: String,
        from_width: u32,
        to_width: u32,
    },

    #[error("combinational cycle through {}", .0.join(", "))]
    CombinationalCycle(Vec<String>),

    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(String),

    #[error("symbol `{0}` is already defined by another module")]
    DuplicateSymbol(String),

    #[error("unknown module handle {0}")]
    UnknownModule(usize),

    #[error("code generation failed: {0}")]
    Codegen(String),

    #[error("unknown input `{0}`")]
    UnknownInput(String),

    #[error("unknown member `{0}`")]
    UnknownMember(String),

    #[error("value for `{name}` needs {bits} bits but the port is {width} bits wide")]
    WidthMismatch { name: String, width: u32, bits: u64 },

    #[error("no debug tap for `{input}` at instance path `{path}`")]
    UnknownTap { path: String, input: String },

    #[error("debug taps were not compiled into this simulator")]
    DebugDisabled,

    #[error("{buffer} buffer is {actual} bytes but compiled code expects {expected}")]
    BufferSizeMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("failed to parse circuit JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JitError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            JitError::UnknownInput(_)
            | JitError::UnknownMember(_)
            | JitError::WidthMismatch { .. }
            | JitError::UnknownTap { .. }
            | JitError::DebugDisabled => ErrorCategory::Usage,
            JitError::BufferSizeMismatch { .. } => ErrorCategory::Runtime,
            _ => ErrorCategory::Build,
        }
    }
}

impl From<cranelift_module::ModuleError> for JitError {
    fn from(e: cranelift_module::ModuleError) -> Self {
        JitError::Codegen(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(JitError::DebugDisabled.category(), ErrorCategory::Usage);
        assert_eq!(
            JitError::UnresolvedSymbol("top_compute_output".into()).category(),
            ErrorCategory::Build
        );
        let mismatch = JitError::BufferSizeMismatch {
            buffer: "input",
            expected: 4,
            actual: 2,
        };
        assert_eq!(mismatch.category(), ErrorCategory::Runtime);
        assert_eq!(
            mismatch.to_string(),
            "input buffer is 2 bytes but compiled code expects 4"
        );
    }

    #[test]
    fn test_cycle_message_lists_instances() {
        let err = JitError::CombinationalCycle(vec!["a0".into(), "a1".into()]);
        assert_eq!(err.to_string(), "combinational cycle through a0, a1");
    }
}
