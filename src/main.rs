use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use memanalysis::{config::Options, Handler};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let options = Options::parse();
    env_logger::Builder::new()
        .filter_level(options.log_level())
        .parse_default_env()
        .init();

    let start = std::time::Instant::now();
    let messages = memanalysis::parse_messages(&options.messages)
        .wrap_err_with(|| format!("failed to load messages from {}", options.messages.display()))?;
    let db = options
        .symbols
        .as_ref()
        .map(|path| {
            memanalysis::parse_symbols(path)
                .wrap_err_with(|| format!("failed to load symbols from {}", path.display()))
        })
        .transpose()?;

    let mut handler = Handler::with_reporter(options.kernel_id(), options.verbose, options.reporter());
    if let Some(arch) = options.arch {
        handler = handler.with_architecture(arch);
    }
    let handled = memanalysis::run(&mut handler, &messages, db.as_ref())
        .wrap_err_with(|| format!("failed to write report to {}", options.location))?;

    log::info!(
        "analyzed {handled} of {} messages in {:?}",
        messages.len(),
        start.elapsed()
    );
    Ok(())
}
