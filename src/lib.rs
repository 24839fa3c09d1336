#![recursion_limit = "256"]

pub mod anchors;
pub mod blocks;
pub mod compiler;
pub mod config;
pub mod decode;
pub mod error;
pub mod inference;
pub mod layers;
pub mod models;
pub mod priors;
