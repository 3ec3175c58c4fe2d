//! mrd-stream: a streaming MRD (ISMRMRD) server and client
//!
//! Framed TCP exchange of raw k-space and image data between an MRD client
//! and a reconstruction server, following the ISMRMRD streaming conventions.

pub mod capture;
pub mod client;
pub mod connection;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod recon;
pub mod server;
pub mod wire;
