#![doc = include_str!("../README.md")]

mod codec;
mod error;
mod packer;
mod pipe;
mod request;
mod session;
mod stream;

pub use codec::*;
pub use error::*;
pub use packer::*;
pub use pipe::*;
pub use request::*;
pub use session::*;
pub use stream::*;

// Re-export BoxFuture so handlers can be written without depending on
// futures directly.
pub use futures::future::BoxFuture;
