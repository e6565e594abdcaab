use clap::Clap;
use std::path::PathBuf;
use termcolor::ColorChoice;

/// Where the listing stream goes: a file, standard output (`-`), or
/// nowhere (`0`).
#[derive(Clone, Debug)]
pub enum ListingTarget {
    Stdout,
    Suppressed,
    File(PathBuf),
}

#[derive(Clap)]
#[clap(name = "fortcal", version = env!("CARGO_PKG_VERSION"), author = "Adolph C.")]
pub struct Opts {
    /// FORTRAN source file to compile. Equivalent to `-i`.
    pub source: Option<PathBuf>,

    /// Source input path.
    #[clap(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Listing output: a path, `-` for stdout, or `0` to suppress.
    /// Suppressed when not given.
    #[clap(short = 'l', long = "listing", parse(from_str = parse_listing))]
    pub listing: Option<ListingTarget>,

    /// Object (CAL text) output path. Defaults to the source path with a
    /// `.cal` extension.
    #[clap(short = 'o', long = "object")]
    pub object: Option<PathBuf>,

    /// Echo source lines into the object as comment lines.
    #[clap(short = 's', long = "source-echo")]
    pub echo_source: bool,

    /// Sets the log level: (default)=+error, 0=+warning, 1=+info, 2=+debug, 3=+trace
    /// The `quiet` flag can be used to turn off logging completely.
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u32,

    /// Disables logging.
    #[clap(short, long)]
    pub quiet: bool,

    /// Coloring: auto, always, never, and always-ansi (only uses ansi color codes).
    #[clap(long = "color", default_value = "auto", parse(try_from_str = parse_colorchoice))]
    pub color_choice: ColorChoice,
}

impl Opts {
    pub fn log_level_filter(&self) -> log::LevelFilter {
        use log::LevelFilter;

        if self.quiet {
            return LevelFilter::Off;
        }

        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn source_path(&self) -> Option<&PathBuf> {
        self.input.as_ref().or(self.source.as_ref())
    }
}

fn parse_listing(s: &str) -> ListingTarget {
    if s == "-" {
        ListingTarget::Stdout
    } else if s == "0" {
        ListingTarget::Suppressed
    } else {
        ListingTarget::File(PathBuf::from(s))
    }
}

pub fn parse_colorchoice(s: &str) -> Result<ColorChoice, String> {
    if s.eq_ignore_ascii_case("auto") {
        Ok(ColorChoice::Auto)
    } else if s.eq_ignore_ascii_case("always") {
        Ok(ColorChoice::Always)
    } else if s.eq_ignore_ascii_case("never") {
        Ok(ColorChoice::Never)
    } else if s.eq_ignore_ascii_case("always-ansi") {
        Ok(ColorChoice::AlwaysAnsi)
    } else {
        Err(format!("{} is not a valid color value", s))
    }
}
