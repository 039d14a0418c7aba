//! NutriLens CLI tool
//!
//! Command-line interface for analysing food photos with the nutrilens library.

#[cfg(feature = "cli")]
use nutrilens::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
