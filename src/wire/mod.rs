pub mod codec;
pub mod index;
