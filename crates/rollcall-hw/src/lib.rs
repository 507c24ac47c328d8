//! rollcall-hw: Camera capture.
//!
//! Opens a V4L2 device and delivers packed RGB frames that the recognition
//! core can sample.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::{Frame, FrameError};
