#![doc = "susi-core: core logic library for susi."]

//! Everything the image-to-post agent does lives here: the capability
//! contracts, the OneDrive, S3, Instagram and email clients, caption
//! generation, the processed-set, and the orchestrator that ties them
//! together. The `susi` crate only parses the CLI and configuration and wires
//! these pieces up.
//!
//! # Usage
//! Build a [`orchestrator::Orchestrator`] from [`orchestrator::Components`]
//! and call `run_once`, `run_forever` or `run_scheduled`.

pub mod caption;
pub mod config;
pub mod contract;
pub mod credentials;
pub mod error;
pub mod exif;
pub mod instagram;
pub mod notify;
pub mod onedrive;
pub mod orchestrator;
pub mod processed;
pub mod retry;
pub mod s3;
pub mod schedule;

pub use error::PipelineError;
