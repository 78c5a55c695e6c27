pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod credential;
pub mod daemon;
pub mod descriptor;
pub mod manager;
pub mod pwctl_cli;
pub mod rpc;
pub mod supervisor;
