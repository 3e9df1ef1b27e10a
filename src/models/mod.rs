pub mod common;
pub mod image;
pub mod outcome;

pub use common::*;
pub use image::*;
pub use outcome::*;
