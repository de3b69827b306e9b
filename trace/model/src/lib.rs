pub mod exec_mask;
pub mod message;

pub use exec_mask::{ExecMask, ToBitString};
pub use message::{AccessMessage, Direction, Error, LaneAccess, MemorySpace, RawMessage, WaveHeader};

/// Number of lanes in a wavefront.
pub const WAVEFRONT_SIZE: usize = 64;
