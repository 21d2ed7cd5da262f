//! # Command-Line Interface
//!
//! Argument parsing for the `kdbus-demo` binary: a small program that
//! builds a [`crate::namespace::Subsystem`], decodes one make-namespace
//! and one make-bus command against it, and prints (optionally as JSON)
//! the resulting object graph.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Decode and apply a make-namespace plus a make-bus command against a
/// fresh in-process broker core, then print the resulting graph.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Name of the child namespace to create under the root namespace.
    #[arg(short = 'n', long, default_value = "demo")]
    pub namespace_name: String,

    /// Name of the bus to create in that namespace. Must begin with
    /// "<uid>-"; the uid used is `--caller-uid`.
    #[arg(short = 'b', long, default_value = "foo")]
    pub bus_name: String,

    /// uid the demo command is issued as, for the bus name-prefix check
    /// and as the default owning gid.
    #[arg(short = 'u', long, default_value_t = 1000)]
    pub caller_uid: u32,

    /// Bloom filter size for the new bus: 8..=16384, a multiple of 8.
    #[arg(long, default_value_t = 64)]
    pub bloom_size: u32,

    /// Print the resulting namespace/bus/name graph as JSON instead of
    /// plain diagnostic lines.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Silence user-facing informational output on stdout.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    ///  -v: debug
    ///  -vv: trace
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file instead of a daily-rolling
    /// default, or to "stderr" to skip the file sink entirely.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}
