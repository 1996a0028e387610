//! Memory management for fiber stack images.
//!
//! Provides the heap buffers that hold a suspended fiber's copy of the
//! physical stack in a no_std environment.

pub mod stack_image;

pub use stack_image::StackImage;
