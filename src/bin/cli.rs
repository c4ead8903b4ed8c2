//! Piboot command line interface.

use std::{
    fs::{self, File},
    io::{self, BufReader, Write},
    path::Path,
    process,
    time::Duration,
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches, SubCommand,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, LevelFilter};
use simplelog::*;

use piboot::{
    packet_layer::{PacketLayer, ResponseHandler},
    transfer::{self, Progress},
    transport::SerialTransport,
    CpuBoost, Error, Settings, SettingsBuilder,
};

fn main() {
    println!("[PB] piboot v{}", crate_version!());

    if let Err(e) = ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(130);
    }) {
        eprintln!("could not install the Ctrl+C handler: {}", e);
    }

    let matches = app().get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'piboot -v -v -v' or 'piboot -vvv' vs 'piboot -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = TermLogger::init(log_level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto) {
        eprintln!("could not set up logging: {}", e);
    }

    trace!("{:#?}", matches);

    let settings = settings_from(&matches);
    let exit_code = match run(&matches, settings) {
        Ok(code) => code,
        Err(e) => {
            println!(
                "{}: {} {}",
                style("error").red(),
                e,
                style(format!("[{}]", e.error_code())).dim()
            );
            1
        }
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(concat!("v", env!("CARGO_PKG_VERSION")))
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Piboot works in tandem with the bootloader running on the \
            Raspberry Pi. The bootloader waits on the serial port for packets \
            from this tool, which can:\n\
               \t* show what the device reports about itself \n\
               \t* load a .hex or .img kernel image into memory and start it \n\
               \t* run a shell command on the device \n\
               \t* copy files to and from the SD card \n\
            \n\
            Transfers switch to a faster baud rate once the device answered \
            a ping; the device falls back to the default rate on its own if \
            the switch fails.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device to use")
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("baud rate the bootloader starts with")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLASH_BAUD")
                .help("baud rate used for transfers")
                .long("--flash-baud")
                .takes_value(true)
                .default_value("1000000")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("CPU_BOOST")
                .help("raise the device CPU clock during transfers")
                .long("--cpu-boost")
                .takes_value(true)
                .possible_values(&["yes", "no", "auto"])
                .default_value("auto")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PACKET_SIZE")
                .help("maximum packet size")
                .long("--packet-size")
                .takes_value(true)
                .default_value("4096")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("TIMEOUT")
                .help("ack timeout in milliseconds")
                .long("--timeout")
                .takes_value(true)
                .default_value("300")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PING_ATTEMPTS")
                .help("number of pings before giving up")
                .long("--ping-attempts")
                .takes_value(true)
                .default_value("20")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("NO_VERSION_CHECK")
                .help("carry on when the bootloader version differs")
                .long("--no-version-check"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .subcommand(SubCommand::with_name("status").about("Shows information about the device"))
        .subcommand(
            SubCommand::with_name("flash")
                .about("Loads a kernel image into memory and starts it")
                .arg(
                    Arg::with_name("IMAGE")
                        .help("the .hex or .img file to load")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("GO_DELAY")
                        .help("milliseconds to wait before starting the image")
                        .long("--go-delay")
                        .takes_value(true)
                        .default_value("300")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("NO_GO")
                        .help("load the image without starting it")
                        .long("--no-go"),
                ),
        )
        .subcommand(
            SubCommand::with_name("exec")
                .about("Runs a shell command on the device")
                .arg(
                    Arg::with_name("COMMAND")
                        .help("the command line to run")
                        .required(true)
                        .multiple(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("CWD")
                        .help("working directory on the device")
                        .long("--cwd")
                        .takes_value(true)
                        .default_value("/")
                        .require_equals(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("push")
                .about("Copies a file to the device")
                .arg(Arg::with_name("LOCAL").required(true).index(1))
                .arg(Arg::with_name("REMOTE").required(true).index(2))
                .arg(
                    Arg::with_name("NO_CLOBBER")
                        .help("don't overwrite an existing file")
                        .short("-n")
                        .long("--no-clobber"),
                ),
        )
        .subcommand(
            SubCommand::with_name("pull")
                .about("Copies a file from the device")
                .arg(Arg::with_name("REMOTE").required(true).index(1))
                .arg(Arg::with_name("LOCAL").required(true).index(2)),
        )
}

/// Parse a numeric argument that has a default value, exiting with a
/// message when it does not parse.
fn numeric<T: std::str::FromStr>(matches: &ArgMatches, name: &str, flag: &str) -> T {
    value_t!(matches.value_of(name), T).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style(flag).cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of(name).unwrap_or_default()).on_red()
        );
        process::exit(-1);
    })
}

fn settings_from(matches: &ArgMatches) -> Settings {
    let cpu_boost = match matches.value_of("CPU_BOOST") {
        Some("yes") => CpuBoost::Yes,
        Some("no") => CpuBoost::No,
        _ => CpuBoost::Auto,
    };

    let mut builder = SettingsBuilder::new()
        .baud_rate(numeric(matches, "BAUD_RATE", "baud-rate"))
        .flash_baud(numeric(matches, "FLASH_BAUD", "flash-baud"))
        .cpu_boost(cpu_boost)
        .max_packet_size(numeric(matches, "PACKET_SIZE", "packet-size"))
        .packet_timeout(Duration::from_millis(numeric(matches, "TIMEOUT", "timeout")))
        .ping_attempts(numeric(matches, "PING_ATTEMPTS", "ping-attempts"))
        .check_version(!matches.is_present("NO_VERSION_CHECK"));

    if let Some(path) = matches.value_of("DEVICE_TTY") {
        builder = builder.path(path);
    }
    if let Some(flash) = matches.subcommand_matches("flash") {
        builder = builder.go_delay(Duration::from_millis(numeric(flash, "GO_DELAY", "go-delay")));
    }
    builder.finalize()
}

fn run(matches: &ArgMatches, settings: Settings) -> Result<i32, Error> {
    let transport = SerialTransport::open(&settings)?;
    let mut layer = PacketLayer::new(transport, settings)?;

    let pb = spinner("waiting for the device...");
    let info = layer.ping();
    pb.finish_and_clear();
    let info = info?;

    match matches.subcommand() {
        ("status", _) => {
            println!("{}", info);
            Ok(0)
        }
        ("flash", Some(sub)) => {
            let image = sub.value_of("IMAGE").unwrap_or_default();
            layer.boost(&info)?;
            let summary = flash(&mut layer, Path::new(image), info.aarch, sub.is_present("NO_GO"))?;
            let start = match summary.start_address {
                Some(address) => format!("0x{:08x}", address),
                None => "the default address".into(),
            };
            if sub.is_present("NO_GO") {
                println!("[PB] 👍 {} bytes loaded, entry point {}", style(summary.bytes).green(), start);
            } else {
                println!("[PB] 👍 {} bytes loaded, starting at {}", style(summary.bytes).green(), start);
            }
            Ok(0)
        }
        ("exec", Some(sub)) => {
            let command: Vec<&str> = sub.values_of("COMMAND").map(|v| v.collect()).unwrap_or_default();
            let cwd = sub.value_of("CWD").unwrap_or("/");
            let outcome = layer.send_command(cwd, &command.join(" "), &mut ConsoleOutput)?;
            debug!("command finished in {}", outcome.cwd);
            Ok(outcome.exit_code)
        }
        ("push", Some(sub)) => {
            let local = Path::new(sub.value_of("LOCAL").unwrap_or_default());
            let remote = sub.value_of("REMOTE").unwrap_or_default();
            let total = fs::metadata(local)?.len();
            layer.boost(&info)?;
            let pb = bytes_bar("Pushing", total);
            let result = transfer::push_file(&mut layer, local, remote, !sub.is_present("NO_CLOBBER"), |p| {
                pb.set_position(p.done)
            });
            pb.finish_and_clear();
            let size = result?;
            println!("[PB] 👍 {} => {} ({} bytes)", local.display(), style(remote).green(), size);
            Ok(0)
        }
        ("pull", Some(sub)) => {
            let remote = sub.value_of("REMOTE").unwrap_or_default();
            let local = Path::new(sub.value_of("LOCAL").unwrap_or_default());
            layer.boost(&info)?;
            let pb = bytes_bar("Pulling", 0);
            let result = transfer::pull_file(&mut layer, remote, local, |p: Progress| {
                if let Some(total) = p.total {
                    pb.set_length(total);
                }
                pb.set_position(p.done)
            });
            pb.finish_and_clear();
            let header = result?;
            println!(
                "[PB] 👍 {} => {} ({} bytes)",
                remote,
                style(local.display()).green(),
                header.size
            );
            Ok(0)
        }
        _ => Ok(0),
    }
}

fn flash(
    layer: &mut PacketLayer<SerialTransport>,
    image: &Path,
    aarch: u32,
    no_go: bool,
) -> Result<transfer::FlashSummary, Error> {
    let is_hex = image
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("hex"));
    let file = File::open(image)?;
    let total = file.metadata()?.len();

    let pb = if is_hex {
        spinner("sending image...")
    } else {
        bytes_bar("Flashing", total)
    };
    let reader = BufReader::new(file);
    let result = if is_hex {
        transfer::flash_image(layer, reader, !no_go, |p| {
            pb.set_message(format!("sent {} bytes", p.done))
        })
    } else {
        transfer::flash_binary(
            layer,
            reader,
            transfer::kernel_load_address(aarch),
            Some(total),
            !no_go,
            |p| pb.set_position(p.done),
        )
    };
    pb.finish_and_clear();
    result
}

/// Prints command output as it streams in.
struct ConsoleOutput;

impl ResponseHandler for ConsoleOutput {
    fn on_stdout(&mut self, data: &[u8]) {
        let mut out = io::stdout();
        let _ = out.write_all(data).and_then(|_| out.flush());
    }

    fn on_stderr(&mut self, data: &[u8]) {
        let _ = io::stderr().write_all(data);
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[PB] {spinner:.blue} {msg}"),
    );
    pb.set_message(message.to_owned());
    pb
}

fn bytes_bar(verb: &str, total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "[PB] ⏩ {} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{eta}})",
                verb
            ))
            .progress_chars("=>-"),
    );
    pb
}
