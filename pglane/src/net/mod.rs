//! Underlying connection transport.
mod socket;

pub use socket::Socket;
