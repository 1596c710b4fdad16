/// Identifier of a preprocessed executable image, assigned by the control
/// plane when the binary's analysis artifact is uploaded.
pub type BinaryId = u64;

pub const INVALID_BINARY_ID: BinaryId = u64::MAX;

pub const MAX_BINARIES: usize = 1024 * 1024;
