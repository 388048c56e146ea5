#[macro_use]
extern crate tracing;

pub mod cloud_provider;
pub mod config;
pub mod constants;
pub mod errors;
pub mod kubeconfig;
pub mod machine;
pub mod metrics;
pub mod network;
pub mod polling;
pub mod runtime;
mod tera_utils;
pub mod userdata;
pub mod utilities;
