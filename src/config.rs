use crate::{
    arch::Architecture,
    handler::KernelId,
    report::{Destination, Format, Reporter},
};
use clap::{builder::FalseyValueParser, ArgAction, Parser};
use std::path::PathBuf;

/// Memory access analysis of a traced GPU kernel dispatch.
///
/// Options can also be set through the environment variables read by the
/// instrumentation host plugin.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    #[arg(help = "JSON file with the access messages of one kernel dispatch")]
    pub messages: PathBuf,
    #[arg(long = "symbols", help = "JSON instruction database of the compiled kernels")]
    pub symbols: Option<PathBuf>,
    #[arg(long = "kernel", default_value = "", help = "name of the analyzed kernel")]
    pub kernel: String,
    #[arg(long = "dispatch-id", default_value_t = 0, help = "dispatch id of the analyzed kernel")]
    pub dispatch_id: u64,
    #[arg(
        long = "location",
        env = "LOGDUR_LOG_LOCATION",
        default_value = "console",
        help = "\"console\" or path of the report file"
    )]
    pub location: Destination,
    #[arg(
        short = 'v',
        long = "verbose",
        env = "LOGDUR_VERBOSE",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        help = "report all accesses and log per access diagnostics"
    )]
    pub verbose: bool,
    #[arg(
        long = "format",
        env = "LOGDUR_LOG_FORMAT",
        default_value = "text",
        help = "report format (text or json)"
    )]
    pub format: Format,
    #[arg(
        long = "arch",
        value_parser = parse_architecture,
        help = "device architecture (e.g. gfx90a:sramecc+:xnack-) reported when no message names a supported one"
    )]
    pub arch: Option<Architecture>,
}

fn parse_architecture(name: &str) -> Result<Architecture, String> {
    Architecture::from_name(name).ok_or_else(|| format!("unsupported architecture {name:?}"))
}

impl Options {
    #[must_use]
    pub fn kernel_id(&self) -> KernelId {
        KernelId {
            name: self.kernel.clone(),
            dispatch_id: self.dispatch_id,
        }
    }

    #[must_use]
    pub fn reporter(&self) -> Reporter {
        Reporter::new(self.location.clone(), self.format)
    }

    /// Default log filter for the verbosity.
    #[must_use]
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        }
    }
}
