//! Error types for the ROP chain compiler.
//!
//! A single typed enum covers every caller-visible failure. Per-gadget
//! analysis drops are deliberately *not* here: they are non-fatal and
//! internal (see [`crate::gadget::DropReason`]). A compile that exhausts
//! its search space is not an error either — it is the
//! [`crate::compiler::CompileOutcome::Failed`] return value.

use thiserror::Error;

/// Primary error type for the ROP compiler.
#[derive(Debug, Error)]
pub enum RopError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed IL source.
    #[error("IL parse error at offset {offset}: {message} (near {token:?})")]
    IlParse {
        /// Byte offset of the offending token in the program text.
        offset: usize,
        /// The offending token.
        token: String,
        /// What went wrong.
        message: String,
    },

    /// A register name that does not exist on the selected architecture.
    #[error("unknown register {name:?} at offset {offset}")]
    UnknownRegister { name: String, offset: usize },

    /// A syscall name missing from the target OS table.
    #[error("unknown syscall {name:?} for the selected OS")]
    UnknownSyscall { name: String },

    /// Wrong number of arguments to a function or syscall IL line.
    #[error("{name} takes {expected} arguments, got {actual}")]
    BadArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// The selected ABI does not apply to the selected architecture.
    #[error("ABI {abi} is not valid for {arch}")]
    AbiMismatch { abi: String, arch: String },

    /// A string store needs a writable scratch range the caller did not
    /// provide.
    #[error("string store requires a scratch address (CompileOptions::scratch)")]
    MissingScratch,

    /// Malformed raw gadget input (bad hex, empty bytes).
    #[error("invalid raw gadget at 0x{addr:016x}: {message}")]
    InvalidRawGadget { addr: u64, message: String },

    /// The constraint forbids every byte value, so no padding exists.
    #[error("all 256 byte values are marked bad; no padding is possible")]
    NoValidByte,

    /// Expression construction violated a width invariant.
    #[error("width error: {0}")]
    Width(String),
}

/// Result type alias for compiler operations.
pub type Result<T> = std::result::Result<T, RopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RopError::IlParse {
            offset: 12,
            token: "eaz".into(),
            message: "expected register".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("eaz"));
    }

    #[test]
    fn test_unknown_register() {
        let err = RopError::UnknownRegister {
            name: "r42".into(),
            offset: 3,
        };
        assert!(err.to_string().contains("r42"));
    }
}
