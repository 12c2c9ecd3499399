//! Tracing setup for the `kiln` binary.
//!
//! Trimmed down from the ambient stack's usual shape: no flamegraph layer,
//! since there's no profiling collaborator in this binary, and `KILN_LOG` in
//! place of the upstream `HURRY_LOG` filter variable.

use clap::ValueEnum;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt as _;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

pub fn make_logger<W>(writer: W, color: WhenColor) -> impl tracing::Subscriber
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    tracing_subscriber::registry().with(ErrorLayer::default()).with({
        let layer = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_target(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(writer);
        match color {
            WhenColor::Always => layer.with_ansi(true),
            WhenColor::Never => layer.with_ansi(false),
            WhenColor::Auto => layer,
        }
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("KILN_LOG")
                .from_env_lossy(),
        )
    })
}
