pub mod device;
pub mod dual;
pub mod frame;
pub mod header;
pub mod mjpeg;
pub mod sim;
pub mod source;

pub use dual::{Camera, DualSource, FrameLayout};
pub use frame::{PixelFormat, RawFrame, SourceDescriptor};
pub use source::{open_source, FrameSource};
