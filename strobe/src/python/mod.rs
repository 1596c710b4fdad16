//! Python interpreter stack reconstruction.

pub mod config;
pub mod thread_state;
pub mod walker;

pub use config::{
    PythonConfig, PythonFrameOwner, PythonInternalsOffsets, PythonVersion, MAX_PYTHON_SYMBOLS,
    MAX_PYTHON_THREADS, MAX_PYTHON_THREAD_STATE_WALK, PYTHON_CFRAME_LINENO,
    PYTHON_MAX_STACK_DEPTH,
};
pub use thread_state::PythonThreadStateCache;
pub use walker::{
    collect_python_stack, PythonFrame, PythonState, PythonSymbol, PythonSymbolCache,
    PythonSymbolKey,
};
