// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line front end over [`dfu_util_rs`]: flag parsing, mode dispatch,
//! and turning an [`Error`] into an exit code.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use dfu_util_rs::descriptor;
use dfu_util_rs::driver::{self, DfuSeOptions};
use dfu_util_rs::error::{Error, ErrorKind};
use dfu_util_rs::file::DfuFile;
use dfu_util_rs::matcher::{self, MatchCriteria};
use dfu_util_rs::progress::{IndicatifSink, NullSink, ProgressSink};

/// Host-side USB DFU (1.0/1.1) and DfuSe firmware upgrade utility.
#[derive(Parser)]
#[command(name = "dfu-util-rs", version, about, arg_required_else_help = true)]
struct Cli
{
	/// Increase verbosity; may be repeated (-v, -vv, -vvv)
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
	verbose: u8,

	/// List the currently attached DFU capable devices
	#[arg(short = 'l', long = "list")]
	list: bool,

	/// Enter DFU mode and detach the run-time firmware, then exit
	#[arg(short = 'e', long = "detach")]
	detach: bool,

	/// Seconds to wait after detaching before re-probing for the DFU device
	#[arg(short = 'E', long = "detach-delay", default_value_t = 5)]
	detach_delay: u64,

	/// Select device(s) by vendor/product id: V:P[,Vd:Pd]
	#[arg(short = 'd', long = "device")]
	device: Option<String>,

	/// Select device by USB path: bus-port.port…
	#[arg(short = 'p', long = "path")]
	path: Option<String>,

	/// Select configuration by its bConfigurationValue
	#[arg(short = 'c', long = "cfg")]
	cfg: Option<u8>,

	/// Select interface by its bInterfaceNumber
	#[arg(short = 'i', long = "intf")]
	intf: Option<u8>,

	/// Select alt-setting by index or by its iInterface string
	#[arg(short = 'a', long = "alt")]
	alt: Option<String>,

	/// Select device(s) by serial number: S[,Sd]
	#[arg(short = 'S', long = "serial")]
	serial: Option<String>,

	/// Select device by its USB device address
	#[arg(short = 'n', long = "devnum")]
	devnum: Option<u8>,

	/// Override the functional descriptor's wTransferSize
	#[arg(short = 't', long = "transfer-size")]
	transfer_size: Option<u16>,

	/// Read firmware off the device into FILE
	#[arg(short = 'U', long = "upload", value_name = "FILE")]
	upload: Option<PathBuf>,

	/// Expected upload length in bytes; stop early once reached
	#[arg(short = 'Z', long = "upload-size")]
	upload_size: Option<u64>,

	/// Write FILE to the device
	#[arg(short = 'D', long = "download", value_name = "FILE")]
	download: Option<PathBuf>,

	/// Issue a USB reset once the operation completes
	#[arg(short = 'R', long = "reset")]
	reset: bool,

	/// Poll until a matching device appears instead of failing immediately
	#[arg(short = 'w', long = "wait")]
	wait: bool,

	/// DfuSe options: addr[:force][:leave][:mass-erase][:unprotect][:will-reset][:upload-limit]
	#[arg(short = 's', long = "dfuse-address")]
	dfuse_address: Option<String>,
}

fn init_logging(verbosity: u8)
{
	let level = match verbosity {
		0 => log::LevelFilter::Warn,
		1 => log::LevelFilter::Info,
		2 => log::LevelFilter::Debug,
		_ => log::LevelFilter::Trace,
	};

	env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

fn parse_uint(token: &str) -> Result<u32, Error>
{
	let trimmed = token.trim();
	if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
		u32::from_str_radix(hex, 16).map_err(|_| ErrorKind::Usage(format!("malformed integer {token:?}")).error())
	} else {
		trimmed.parse().map_err(|_| ErrorKind::Usage(format!("malformed integer {token:?}")).error())
	}
}

fn is_dfuse_keyword(token: &str) -> bool
{
	matches!(token, "force" | "leave" | "mass-erase" | "unprotect" | "will-reset")
}

/// Parses `-s/--dfuse-address`'s `addr[:tok…]` value. The leading address is
/// only present when the first colon-separated field isn't itself one of the
/// known keyword tokens, so `-s leave` works without an address the same way
/// `dfu-util` accepts it.
fn parse_dfuse_address(spec: &str) -> Result<DfuSeOptions, Error>
{
	let mut options = DfuSeOptions::default();
	let mut tokens = spec.split(':').peekable();

	if let Some(&first) = tokens.peek() {
		if !first.is_empty() && !is_dfuse_keyword(first) {
			options.address = Some(parse_uint(first)?);
			tokens.next();
		}
	}

	for token in tokens {
		match token {
			"force" => options.force = true,
			"leave" => options.leave = true,
			"mass-erase" => options.mass_erase = true,
			"unprotect" => options.unprotect = true,
			"will-reset" => options.will_reset = true,
			other => options.upload_limit = Some(u64::from(parse_uint(other)?)),
		}
	}

	Ok(options)
}

fn parse_alt(token: &str) -> (Option<u8>, Option<String>)
{
	match token.parse::<u8>() {
		Ok(index) => (Some(index), None),
		Err(_) => (None, Some(token.to_string())),
	}
}

fn build_criteria(cli: &Cli) -> Result<MatchCriteria, Error>
{
	let mut criteria = MatchCriteria { path: cli.path.clone(), config_index: cli.cfg, interface_index: cli.intf, devnum: cli.devnum, ..MatchCriteria::default() };

	if let Some(device) = &cli.device {
		criteria.device = Some(matcher::parse_device_spec(device)?);
	}

	if let Some(serial) = &cli.serial {
		let (runtime, dfu) = matcher::parse_serial_spec(serial);
		criteria.serial_runtime = runtime;
		criteria.serial_dfu = dfu;
	}

	if let Some(alt) = &cli.alt {
		let (index, name) = parse_alt(alt);
		criteria.alt_index = index;
		criteria.alt_name = name;
	}

	Ok(criteria)
}

/// `-w/--wait`: poll the bus every 200ms until `criteria` matches at least
/// one interface, with no overall timeout.
fn wait_for_match(criteria: &MatchCriteria) -> Result<(), Error>
{
	let start = Instant::now();
	loop {
		let all = descriptor::walk()?;
		if !matcher::filter(&all, criteria).is_empty() {
			return Ok(());
		}

		log::trace!("waiting for a matching device: {} ms elapsed", start.elapsed().as_millis());
		thread::sleep(Duration::from_millis(200));
	}
}

fn run(cli: &Cli) -> Result<(), Error>
{
	let modes = [cli.list, cli.detach, cli.upload.is_some(), cli.download.is_some()].iter().filter(|m| **m).count();
	if modes == 0 {
		return Err(ErrorKind::Usage("one of -l/-e/-U/-D is required".into()).error());
	}
	if modes > 1 {
		return Err(ErrorKind::Usage("-l, -e, -U and -D are mutually exclusive".into()).error());
	}

	let criteria = build_criteria(cli)?;
	let detach_delay_ms = cli.detach_delay.saturating_mul(1000);

	if cli.wait {
		wait_for_match(&criteria)?;
	}

	if cli.list {
		return driver::cmd_list(&criteria);
	}

	if cli.detach {
		return driver::cmd_detach(&criteria, detach_delay_ms);
	}

	let progress: Box<dyn ProgressSink> = if cli.verbose == 0 { Box::new(NullSink) } else { Box::new(IndicatifSink::new()) };

	let dfuse_options = match &cli.dfuse_address {
		Some(spec) => parse_dfuse_address(spec)?,
		None => DfuSeOptions::default(),
	};

	if let Some(path) = &cli.upload {
		let firmware = driver::cmd_upload(&criteria, detach_delay_ms, cli.transfer_size, cli.upload_size, &dfuse_options, progress.as_ref())?;
		fs::write(path, &firmware).map_err(|e| ErrorKind::CantCreate(e.to_string()).error_from(e))?;
		println!("Upload done, wrote {} bytes to {}", firmware.len(), path.display());
		return Ok(());
	}

	if let Some(path) = &cli.download {
		let raw = fs::read(path).map_err(Error::from)?;
		let file = match DfuFile::parse(raw.clone()) {
			Ok(file) => file,
			Err(err) => {
				log::warn!("{path:?} has no valid DFU suffix ({err}); treating it as a raw payload");
				DfuFile { firmware: raw, prefix_len: 0, suffix_len: 0, id_vendor: 0, id_product: 0, bcd_device: 0, bcd_dfu: 0 }
			},
		};

		driver::cmd_download(&criteria, detach_delay_ms, cli.transfer_size, &file, &dfuse_options, cli.reset, progress.as_ref())?;
		println!("Download done");
		return Ok(());
	}

	unreachable!("mode-exclusivity check above guarantees one of list/detach/upload/download is set")
}

fn main()
{
	let cli = Cli::parse();
	init_logging(cli.verbose);

	if let Err(err) = run(&cli) {
		eprintln!("dfu-util-rs: {err}");
		std::process::exit(err.exit_code());
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn dfuse_address_with_address_and_tokens()
	{
		let options = parse_dfuse_address("0x08000000:force:leave").unwrap();
		assert_eq!(options.address, Some(0x0800_0000));
		assert!(options.force);
		assert!(options.leave);
	}

	#[test]
	fn dfuse_address_keyword_only_has_no_address()
	{
		let options = parse_dfuse_address("mass-erase").unwrap();
		assert_eq!(options.address, None);
		assert!(options.mass_erase);
	}

	#[test]
	fn dfuse_address_trailing_bare_integer_is_upload_limit()
	{
		let options = parse_dfuse_address("0x08000000:4096").unwrap();
		assert_eq!(options.address, Some(0x0800_0000));
		assert_eq!(options.upload_limit, Some(4096));
	}

	#[test]
	fn alt_token_numeric_is_index_not_name()
	{
		assert_eq!(parse_alt("2"), (Some(2), None));
	}

	#[test]
	fn alt_token_non_numeric_is_name()
	{
		assert_eq!(parse_alt("Flash"), (None, Some("Flash".to_string())));
	}
}
