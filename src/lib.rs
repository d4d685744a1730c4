#![forbid(unsafe_code)]

//! ApsaraFlow: a media-fetch gateway that resolves remote media, runs the
//! fetch engine and encoder, and hands the result to an HTTP body.

pub mod config;
pub mod delivery;
pub mod descriptor;
pub mod error;
pub mod filename;
pub mod filter;
pub mod gate;
pub mod pipe;
pub mod pipeline;
pub mod request;
pub mod resolver;
pub mod security;
pub mod strategy;
pub mod toolchain;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
