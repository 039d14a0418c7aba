//! CLI module for the nutrilens tool

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, Cli};
