pub mod listen;
pub mod write;

pub use listen::{ListenStream, WatchStreamDelegate};
pub use write::{WriteResponse, WriteStream, WriteStreamDelegate};
