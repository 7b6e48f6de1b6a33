//! JPIP (JPEG2000 Interactive Imaging Protocol) client engine.
//!
//! Request and channel management for interactive remote access to
//! JPEG2000 images: the flow regulator, request queues and dependency
//! graph, the CID scheduler, and the TCP/UDP aux channel reception path.
//! Decoding, rendering, TLS and authentication are out of scope -- this
//! crate only manages what to ask the server for and where the bytes
//! that come back belong in the data-bin cache.

pub mod aux;
pub mod cachefile;
pub mod cid;
pub mod client;
pub mod config;
pub mod databin;
pub mod error;
mod flow;
mod headers;
pub mod model;
pub mod monitor;
pub mod primary;
pub mod query;
pub mod queue;
pub mod request;
pub mod status;
mod version;
pub mod woi;

pub use client::{Client, ClientHandle};
pub use config::JpipConfig;
pub use error::{Error, Result};
