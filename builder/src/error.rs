use thiserror::Error;

pub type Result<T> = core::result::Result<T, BuildError>;

/// Errors that abort the build with a user-visible report.
///
/// Each variant carries the reachability chain of the offending object,
/// because the root cause is nearly always an accidental dependency
/// introduced by host-side code that ran during the build. Programmer
/// errors (out-of-phase admission, unaligned reference writes, duplicate
/// partition assignment) panic instead. There is no local recovery for
/// either class; partial outputs are undefined.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The central safety net: the heap reached an object whose type static
    /// analysis never saw instantiated.
    #[error("image heap contains an object of type {type_name}, which was not seen as instantiated during static analysis; a hosted cache or static field was probably modified during the build\n{chain}")]
    NotInstantiated { type_name: String, chain: String },

    #[error("the hub of type {type_name} has no class initialization info; static analysis did not process this type\n{chain}")]
    HubNotInitialized { type_name: String, chain: String },

    #[error("a word value of type {type_name} must not be stored in the image heap\n{chain}")]
    WordValueInHeap { type_name: String, chain: String },

    #[error("the host class handle for {type_name} must be represented by its hub in the image heap\n{chain}")]
    ClassHandleInHeap { type_name: String, chain: String },

    /// A hybrid tail array or bit set was reached independently of the
    /// instance its bytes are inlined into.
    #[error("{what} is embedded in a hybrid object and must not appear as a standalone image object\n{chain}")]
    EmbeddedObjectReached { what: String, chain: String },

    /// Emission found a reference whose target was never admitted: the
    /// object graph changed between analysis and writing.
    #[error("emission reached {what} that was never admitted to the image heap; the object graph changed after analysis\n{chain}")]
    UnadmittedTarget { what: String, chain: String },

    #[error("a method pointer to {method} cannot be written: the method has no compiled code\n{chain}")]
    MethodNotCompiled { method: String, chain: String },

    #[error("string {value:?} was interned by the host after the intern table was sealed")]
    LateInternedString { value: String },
}
