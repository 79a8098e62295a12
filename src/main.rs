//! Command-line front end: argument handling, logging setup, output-name
//! derivation, and the exit-code contract.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};

use tivodec::cipher::TuringStream;
use tivodec::config::DecoderConfig;
use tivodec::error::TivoError;
use tivodec::format::{container, ContainerFormat, Decoder, TivoFile};
use tivodec::utils::TivoSource;

#[derive(Parser)]
#[command(
    name = "tivodec",
    version,
    about = "Decrypt a TiVo recording into a standard MPEG-PS or MPEG-TS file",
    after_help = "The input file and the output file may both be given as -, \
                  meaning stdin and stdout respectively. Without --out the \
                  output name is derived from the input name and the \
                  recording metadata."
)]
struct Args {
    /// Media access key of the DVR that made the recording
    #[arg(short = 'm', long = "mak", value_name = "KEY")]
    mak: String,

    /// Output file; - for stdout
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    out: Option<PathBuf>,

    /// Do not verify the MAK while decoding
    #[arg(short = 'n', long = "no-verify")]
    no_verify: bool,

    /// Dump the recording metadata chunks as XML files
    #[arg(short = 'D', long = "metadata")]
    dump_metadata: bool,

    /// Do not decode the video; exit after the metadata
    #[arg(short = 'x', long = "no-video")]
    no_video: bool,

    /// Verbose diagnostics; repeat for more detail
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dump one transport packet number in full; may be repeated
    #[arg(short = 'p', long = "pkt-dump", value_name = "N")]
    pkt_dump: Vec<u32>,

    /// The .TiVo recording; - for stdin
    input: String,
}

// Exit codes, matching the historical tool.
const EXIT_OPEN_INPUT: u8 = 6;
const EXIT_OPEN_OUTPUT: u8 = 7;
const EXIT_BAD_CONTAINER: u8 = 8;
const EXIT_DECODER: u8 = 9;

fn init_logging(args: &Args) {
    let mut level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if !args.pkt_dump.is_empty() {
        level = level.max(LevelFilter::Debug);
    }
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);
    eprintln!("Encryption by QUALCOMM ;)");
    ExitCode::from(run(args).await)
}

async fn run(args: Args) -> u8 {
    let config = DecoderConfig {
        verbose: args.verbose,
        pkt_dump: args.pkt_dump.iter().copied().collect(),
        no_verify: args.no_verify,
        dump_metadata: args.dump_metadata,
        no_video: args.no_video,
    };

    if !config.no_verify && !TuringStream::verify_mak(&args.mak) {
        log::error!("media access key must be a ten-digit number");
        return EXIT_DECODER;
    }

    log::info!("reading from {}", args.input);
    let reader: Box<dyn AsyncRead + Unpin + Send> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        match tokio::fs::File::open(&args.input).await {
            Ok(file) => Box::new(file),
            Err(e) => {
                log::error!("cannot open {}: {}", args.input, e);
                return EXIT_OPEN_INPUT;
            }
        }
    };
    let mut source = TivoSource::new(reader);

    let file = match container::open(&mut source, &args.mak, &config).await {
        Ok(file) => file,
        Err(e @ TivoError::MakVerificationFailed) => {
            log::error!("{}", e);
            return EXIT_DECODER;
        }
        Err(e) => {
            log::error!("container read failed: {}", e);
            return EXIT_BAD_CONTAINER;
        }
    };

    if config.dump_metadata {
        if let Err(e) = dump_metadata(&args.input, &file).await {
            log::error!("cannot write metadata chunk: {}", e);
            return EXIT_BAD_CONTAINER;
        }
    }
    if config.no_video {
        return 0;
    }

    let dest = match &args.out {
        Some(path) if path.as_os_str() == "-" => None,
        Some(path) => Some(path.clone()),
        None => Some(derived_output_path(&args.input, &file)),
    };

    let sink: Box<dyn AsyncWrite + Unpin + Send> = match &dest {
        None => {
            log::info!("writing to stdout");
            Box::new(tokio::io::stdout())
        }
        Some(path) => {
            log::info!("writing to {}", path.display());
            match tokio::fs::File::create(path).await {
                Ok(file) => Box::new(file),
                Err(e) => {
                    log::error!("cannot create {}: {}", path.display(), e);
                    return EXIT_OPEN_OUTPUT;
                }
            }
        }
    };

    let mut decoder = Decoder::new(
        file.header.format(),
        file.main_session,
        source,
        BufWriter::new(sink),
        config,
    );
    match decoder.process().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("decoding failed: {}", e);
            EXIT_DECODER
        }
    }
}

/// Base name for derived outputs: the metadata-derived program name when
/// available, otherwise the input stem. Short extensions (`.TiVo` and the
/// like) are lopped off; anything longer is taken to be part of the name.
fn output_base(input: &str, file: &TivoFile) -> String {
    if let Some(name) = &file.derived_name {
        return name.clone();
    }
    let path = Path::new(input);
    let keep_ext = path
        .extension()
        .map(|e| e.len() > 4)
        .unwrap_or(false);
    let base = if keep_ext {
        path.file_name()
    } else {
        path.file_stem()
    };
    base.map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tivo".to_string())
}

fn output_dir(input: &str) -> PathBuf {
    Path::new(input)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn derived_output_path(input: &str, file: &TivoFile) -> PathBuf {
    let extension = match file.header.format() {
        ContainerFormat::ProgramStream => "mpg",
        ContainerFormat::TransportStream => "ts",
    };
    output_dir(input).join(format!("{}.{}", output_base(input, file), extension))
}

/// Writes each metadata chunk next to the output as
/// `<base>-<index>-<id>.xml`.
async fn dump_metadata(input: &str, file: &TivoFile) -> std::io::Result<()> {
    let dir = output_dir(input);
    let base = output_base(input, file);
    for (i, chunk) in file.chunks.iter().enumerate() {
        let path = dir.join(format!("{}-{:02}-{:04x}.xml", base, i, chunk.id));
        log::info!("metadata chunk {} -> {}", i, path.display());
        tokio::fs::write(&path, &chunk.data).await?;
    }
    Ok(())
}
