//! Shared engine for the `rbcp` resumable copy tool.
//!
//! The interesting parts live in [`copy`] (the retry/transfer loop) and
//! [`direct`] (unbuffered file handles). Binaries wrap their body in [`run`],
//! which owns the tracing subscriber and the translation from a typed copy
//! failure to a process outcome.

pub mod config;
pub mod copy;
pub mod direct;
pub mod progress;
mod testutils;

pub use config::OutputConfig;

/// Top-level harness for the binaries: installs the tracing subscriber,
/// runs the tool body and reports the outcome. Returns `None` on failure so
/// the caller owns the exit status; resources held by the body are released
/// before this returns on every path.
pub fn run<F>(output: &OutputConfig, func: F) -> Option<copy::Summary>
where
    F: FnOnce() -> Result<copy::Summary, copy::Error>,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.level_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    match func() {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            tracing::error!(
                "re-run with start offset {} to resume",
                error.summary.position
            );
            if output.print_summary {
                println!("{}", &error.summary);
            }
            None
        }
    }
}
