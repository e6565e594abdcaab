pub mod cli;
pub mod logging;

use anyhow::Context as _;
use clap::Clap as _;
use cli::{ListingTarget, Opts};
use f77::compile::{self, listing::Listing, CompileOptions};
use logging::AppLogger;
use std::fs::File;
use std::io::{BufWriter, Read as _, Write};
use std::path::PathBuf;
use termcolor::ColorChoice;

pub fn run() -> anyhow::Result<()> {
    let opts = Opts::parse();

    AppLogger::instance().set_level(opts.log_level_filter());
    match opts.color_choice {
        ColorChoice::Auto => {
            AppLogger::instance().set_color_choice(if atty::is(atty::Stream::Stderr) {
                ColorChoice::Always
            } else {
                ColorChoice::Never
            });
        }
        choice => AppLogger::instance().set_color_choice(choice),
    }

    let source_path = opts
        .source_path()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no source file was given"))?;
    log::debug!("compiling {}", source_path.display());

    let mut source_text = String::new();
    File::open(&source_path)
        .and_then(|mut f| f.read_to_string(&mut source_text))
        .with_context(|| format!("failed to read source `{}`", source_path.display()))?;

    let object_path = opts
        .object
        .clone()
        .unwrap_or_else(|| default_object_path(&source_path));
    let object_file = File::create(&object_path)
        .with_context(|| format!("failed to create object `{}`", object_path.display()))?;
    let mut object = BufWriter::new(object_file);

    let mut listing = open_listing(opts.listing.as_ref())?;

    let compile_timer = std::time::Instant::now();
    let summary = compile::compile(
        &source_text,
        CompileOptions {
            echo_source: opts.echo_source,
        },
        &mut object,
        listing.as_mut(),
    )?;
    object.flush().context("failed to flush object output")?;
    log::info!(
        "compiled {} in {}",
        source_path.display(),
        f77::util::DurationDisplay(compile_timer.elapsed())
    );

    if summary.errors > 0 {
        anyhow::bail!("compilation failed: {} errors", summary.errors);
    }
    Ok(())
}

fn default_object_path(source: &PathBuf) -> PathBuf {
    let mut p = source.clone();
    p.set_extension("cal");
    p
}

fn open_listing(target: Option<&ListingTarget>) -> anyhow::Result<Option<Listing>> {
    match target {
        None | Some(ListingTarget::Suppressed) => Ok(None),
        Some(ListingTarget::Stdout) => Ok(Some(Listing::new(Box::new(std::io::stdout())))),
        Some(ListingTarget::File(path)) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create listing `{}`", path.display()))?;
            Ok(Some(Listing::new(Box::new(BufWriter::new(file)))))
        }
    }
}
