pub mod buffer;
pub mod sample;
pub mod window;
