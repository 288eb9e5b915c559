//! Record I/Q samples from a Fobos SDR.
//!
//! ```bash
//! fobos_rx --list
//! fobos_rx --info
//! fobos_rx -f 433.92M -s 10M --lna 2 --vga 8 -n 20M -o ism.cf32
//! fobos_rx -f 5.8G --format cs16 -o - | some_dsp_tool
//! fobos_rx --simulate -f 100M -n 1M -o /dev/null -vv
//! ```

use clap::{ArgAction, Parser, ValueEnum};
use fobos::sim::{SimulatedTransport, tone_pattern};
use fobos::{ClockSource, Fobos, FobosConfig, StreamStats};
use num_complex::Complex;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::process;
use std::str::FromStr;
use std::time::Instant;

/// Tone played back by `--simulate`: period in samples and amplitude.
const SIM_TONE_PERIOD: usize = 40;
const SIM_TONE_AMPLITUDE: i16 = 3000;

#[derive(Debug, Clone, Copy)]
struct Frequency(f64);

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, scale) = if let Some(stripped) = s.strip_suffix('G') {
            (stripped, 1e9)
        } else if let Some(stripped) = s.strip_suffix('M') {
            (stripped, 1e6)
        } else if let Some(stripped) = s.strip_suffix('k') {
            (stripped, 1e3)
        } else {
            (s, 1.0)
        };
        let val: f64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("Invalid frequency: {}", s))?;
        Ok(Frequency(val * scale))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Interleaved little-endian f32
    Cf32,
    /// Interleaved little-endian i16, full scale 32767
    Cs16,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Record I/Q samples from a Fobos SDR", long_about = None)]
struct Args {
    /// List connected devices and exit
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Print board information and exit
    #[arg(long, default_value_t = false)]
    info: bool,

    /// Use a simulated device playing back a test tone
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Device index
    #[arg(short, long, default_value_t = 0)]
    device: u32,

    /// Center frequency in Hz (accepts k/M/G suffix, e.g. 433.92M)
    #[arg(short, long, value_parser = Frequency::from_str)]
    frequency: Option<Frequency>,

    /// Sample rate in Hz, snapped to the nearest supported rate
    #[arg(short, long, value_parser = Frequency::from_str, default_value = "10M")]
    sample_rate: Frequency,

    /// LNA gain (0-3)
    #[arg(long, default_value_t = 0)]
    lna: u8,

    /// VGA gain (0-15)
    #[arg(long, default_value_t = 0)]
    vga: u8,

    /// Low-pass filter override (0-2)
    #[arg(long)]
    lpf: Option<u8>,

    /// Sample the HF input directly
    #[arg(long, default_value_t = false)]
    direct: bool,

    /// Use the external reference clock
    #[arg(long, default_value_t = false)]
    external_clock: bool,

    /// Number of samples to record (k/M suffix accepted), 0 until Ctrl-C
    #[arg(short = 'n', long, value_parser = Frequency::from_str, default_value = "0")]
    samples: Frequency,

    /// Output sample format
    #[arg(long, value_enum, default_value = "cf32")]
    format: OutputFormat,

    /// Output file, `-` for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Transfers in flight (0 for the default)
    #[arg(long, default_value_t = 0)]
    buffers: u32,

    /// Complex samples per transfer (0 for the default)
    #[arg(long, default_value_t = 0)]
    buf_length: u32,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    // 0 = WARN (quiet), 1 = INFO, 2 = DEBUG, 3+ = TRACE
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    let result = if args.list {
        list()
    } else if args.info {
        info(&args)
    } else {
        record(&args)
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn open(args: &Args) -> fobos::Result<Fobos> {
    if args.simulate {
        let sim = SimulatedTransport::new();
        sim.set_pattern(tone_pattern(SIM_TONE_PERIOD, SIM_TONE_AMPLITUDE));
        Ok(Fobos::with_transport(Box::new(sim)))
    } else {
        Fobos::open(args.device)
    }
}

fn list() -> Result<(), Box<dyn std::error::Error>> {
    let serials = fobos::list_devices()?;
    if serials.is_empty() {
        eprintln!("No Fobos SDR found");
    }
    for (i, serial) in serials.iter().enumerate() {
        println!("[{}] {}", i, serial);
    }
    Ok(())
}

fn info(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let api = fobos::api_info();
    println!("Library:   {} ({})", api.lib_version, api.driver_version);

    let dev = open(args)?;
    let board = dev.board_info()?;
    println!("Board:     {} {}", board.manufacturer, board.product);
    println!("Serial:    {}", board.serial);
    println!("Hardware:  {}", board.hw_revision);
    println!("Firmware:  {}", board.fw_version);
    println!("Sample rates:");
    for rate in dev.samplerates()? {
        println!("  {:>6.2} MSPS", rate / 1e6);
    }
    Ok(())
}

fn write_samples<W: Write>(
    out: &mut W,
    samples: &[Complex<f32>],
    format: OutputFormat,
) -> std::io::Result<()> {
    match format {
        OutputFormat::Cf32 => {
            for s in samples {
                out.write_all(&s.re.to_le_bytes())?;
                out.write_all(&s.im.to_le_bytes())?;
            }
        }
        OutputFormat::Cs16 => {
            for s in samples {
                for v in [s.re, s.im] {
                    let q = (v * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    out.write_all(&q.to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}

fn record(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let Some(Frequency(frequency)) = args.frequency else {
        return Err("a center frequency is required (-f)".into());
    };

    let mut config = FobosConfig::new(args.device, frequency, args.sample_rate.0)
        .with_gains(args.lna, args.vga)
        .with_direct_sampling(args.direct)
        .with_buffers(args.buffers, args.buf_length);
    if let Some(lpf) = args.lpf {
        config = config.with_lpf(lpf);
    }
    if args.external_clock {
        config = config.with_clock_source(ClockSource::External);
    }

    let mut dev = open(args)?;
    config.apply(&mut dev)?;
    eprintln!(
        "Recording {:.0} Hz at {:.0} S/s",
        dev.frequency()?,
        dev.samplerate()?
    );

    let sink: Box<dyn Write> = if args.output == "-" {
        Box::new(stdout().lock())
    } else {
        Box::new(File::create(&args.output)?)
    };
    let mut out = BufWriter::new(sink);

    let cancel = dev.cancel_handle();
    {
        let cancel = cancel.clone();
        if ctrlc::set_handler(move || {
            let _ = cancel.cancel();
        })
        .is_err()
        {
            eprintln!("Could not set Ctrl-C handler");
        }
    }

    let limit = args.samples.0 as u64;
    let mut written = 0u64;
    let mut write_error = None;
    let start = Instant::now();

    let result = dev.read_async(
        |samples| {
            if write_error.is_some() {
                return;
            }
            let take = if limit == 0 {
                samples.len()
            } else {
                samples.len().min((limit - written) as usize)
            };
            if let Err(e) = write_samples(&mut out, &samples[..take], args.format) {
                write_error = Some(e);
                let _ = cancel.cancel();
                return;
            }
            written += take as u64;
            if limit != 0 && written >= limit {
                let _ = cancel.cancel();
            }
        },
        config.buf_count,
        config.buf_length,
    );
    let duration = start.elapsed().as_secs_f64();
    out.flush()?;

    print_stats(&dev.stream_stats(), written, duration);
    if let Some(e) = write_error {
        return Err(e.into());
    }
    result?;
    Ok(())
}

fn print_stats(stats: &StreamStats, written: u64, duration: f64) {
    eprintln!();
    eprintln!("Recording complete:");
    eprintln!("  Samples written: {}", written);
    eprintln!("  Buffers: {} ({} delivered)", stats.buffers, stats.delivered);
    if stats.short_transfers > 0 {
        eprintln!("  Short transfers: {}", stats.short_transfers);
    }
    if stats.device_lost {
        eprintln!("  Device lost");
    }
    eprintln!("  Duration: {:.2} s", duration);
    if duration > 0.0 {
        eprintln!(
            "  Effective rate: {:.3} MSPS",
            written as f64 / duration / 1_000_000.0
        );
    }
}
