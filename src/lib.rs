//! Decrypting range-request proxy for Deezer tracks.
//!
//! Resolves a stream token to a quality that is actually available,
//! fetches the encrypted track from the CDN with range requests and
//! decrypts it on the fly, so that any HTTP client can play and seek it as
//! a plain audio file.
//!
//! * [`track`] - stream descriptors and quality levels
//! * [`cdn`] - CDN URL derivation
//! * [`decrypt`] - striped block decryption
//! * [`stream`] - decrypted byte-range streams
//! * [`fallback`] - quality and track fallback
//! * [`gateway`] - catalog client
//! * [`server`] - HTTP front end
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod arl;
pub mod catalog;
pub mod cdn;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod http;
pub mod protocol;
pub mod secrets;
pub mod server;
pub mod stream;
pub mod track;
