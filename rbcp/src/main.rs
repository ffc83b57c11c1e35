use anyhow::{Context, anyhow};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rbcp",
    version,
    about = "Resumable copy for very large files",
    long_about = "`rbcp` copies a byte range from a source file to a destination file, starting
at an arbitrary offset. It uses unbuffered (direct) I/O to work around
filesystem bugs that break very large cached copies, retries transient
read/write failures with backoff, and reports the offset to resume from when
it has to give up.

EXAMPLE:
    # Start a copy from the beginning
    rbcp /mnt/big.img /backup/big.img 0

    # Resume after a failed run that got to byte 52613349376
    rbcp /mnt/big.img /backup/big.img 52613349376

A supervisor loop can re-invoke rbcp with the last reported offset until it
exits successfully."
)]
struct Args {
    // Transfer options
    /// Size of each read/write chunk
    #[arg(
        long,
        default_value = "1MiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    chunk_size: String,

    /// Consecutive failures allowed per chunk phase before giving up
    #[arg(
        long,
        default_value = "10",
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..),
        help_heading = "Transfer options"
    )]
    retry_attempts: u32,

    /// Base delay between retries; attempt N sleeps N times this long
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "1s", "2min" etc.
    #[arg(
        long,
        default_value = "1s",
        value_name = "DELAY",
        help_heading = "Transfer options"
    )]
    retry_delay: String,

    /// Disable unbuffered (direct) I/O
    ///
    /// Direct I/O is the workaround for the large-file filesystem bug this tool
    /// exists for; only disable it on filesystems known not to need it.
    #[arg(long, help_heading = "Transfer options")]
    no_direct: bool,

    // Progress & output
    /// Don't rewrite the per-chunk progress line on stderr
    #[arg(long, help_heading = "Progress & output")]
    no_progress: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors or progress
    #[arg(
        short = 'q',
        long = "quiet",
        conflicts_with = "verbose",
        help_heading = "Progress & output"
    )]
    quiet: bool,

    // ARGUMENTS
    /// Source file
    src: std::path::PathBuf,

    /// Destination file, created if absent; never truncated
    dst: std::path::PathBuf,

    /// Byte offset at which to start (or resume) the copy
    start: u64,

    /// Reserved for bounded-length transfer; accepted and currently ignored
    count: Option<u64>,
}

fn transfer_settings(args: &Args) -> anyhow::Result<common::copy::Settings> {
    let chunk_size = args
        .chunk_size
        .parse::<bytesize::ByteSize>()
        .map_err(|error| anyhow!("invalid --chunk-size {:?}: {error}", args.chunk_size))?
        .as_u64() as usize;
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be greater than zero");
    }
    let retry_delay = humantime::parse_duration(&args.retry_delay)
        .with_context(|| format!("invalid --retry-delay {:?}", args.retry_delay))?;
    Ok(common::copy::Settings {
        chunk_size,
        max_attempts: args.retry_attempts,
        retry_delay,
        direct_io: !args.no_direct,
    })
}

fn run_copy(args: Args) -> Result<common::copy::Summary, common::copy::Error> {
    let base = common::copy::Summary {
        position: args.start,
        ..Default::default()
    };
    let settings =
        transfer_settings(&args).map_err(|err| common::copy::Error::new(err, base))?;
    if args.count.is_some() {
        tracing::warn!("the COUNT argument is reserved and currently ignored");
    }
    let mut printer = if args.no_progress || args.quiet {
        None
    } else {
        Some(common::progress::ProgressPrinter::new())
    };
    common::copy::copy_range(&args.src, &args.dst, args.start, &settings, printer.as_mut())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let func = {
        let args = args.clone();
        move || run_copy(args)
    };
    if common::run(&output, func).is_none() {
        std::process::exit(1);
    }
    Ok(())
}
