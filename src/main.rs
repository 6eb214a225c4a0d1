mod coeffs;
mod config;
mod patterns;
mod runner;
mod watchdog;

use clap::{ArgGroup, Parser};
use config::FixIirConfig;
use runner::{CommandSpec, FixIirRequest, MetricsResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run FloPoCo FixIIR and extract the filter worst-case peak gain (H),
/// the error-amplification peak gain (Heps) and the guard-bit extension (lsbExt).
#[derive(Parser, Debug)]
#[command(name = "fixiir-metrics", version, about)]
#[command(group(ArgGroup::new("numerator").required(true).args(["coeffb", "coeffb_values"])))]
#[command(group(ArgGroup::new("denominator").required(true).args(["coeffa", "coeffa_values"])))]
pub struct Cli {
    /// Numerator coefficients, ':'-separated hex-float list
    #[arg(long, allow_hyphen_values = true)]
    coeffb: Option<String>,

    /// Numerator coefficients as decimals (e.g. 0.25,0.5,0.25)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    coeffb_values: Option<Vec<f64>>,

    /// Denominator coefficients, ':'-separated hex-float list (typically a[1:])
    #[arg(long, allow_hyphen_values = true)]
    coeffa: Option<String>,

    /// Denominator coefficients as decimals (typically a[1:])
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    coeffa_values: Option<Vec<f64>>,

    /// Input LSB position (default: from config, -12)
    #[arg(long, allow_negative_numbers = true)]
    lsb_in: Option<i32>,

    /// Output LSB position (default: from config, -12)
    #[arg(long, allow_negative_numbers = true)]
    lsb_out: Option<i32>,

    /// FloPoCo log level; 1 is needed for the lines we parse
    #[arg(long)]
    loglevel: Option<i32>,

    /// 0 skips figure generation
    #[arg(long)]
    generate_figures: Option<i32>,

    /// FloPoCo executable (default: flopoco on PATH, then ./build/flopoco)
    #[arg(long)]
    flopoco: Option<PathBuf>,

    /// Extra argument passed to FloPoCo verbatim, e.g. target=Kintex7 (repeatable)
    #[arg(long = "extra", allow_hyphen_values = true)]
    extra: Vec<String>,

    /// Wall-clock timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// H to report when a clean run does not announce it
    #[arg(long, allow_negative_numbers = true)]
    fallback_h: Option<f64>,

    /// Config file path
    #[arg(short, long, default_value = "fixiir.toml")]
    config: PathBuf,

    /// Print the resolved command line and exit
    #[arg(long)]
    dry_run: bool,

    /// Print metrics as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging (resolution, pattern hits, process lifecycle)
    #[arg(short, long)]
    verbose: bool,
}

/// Merge CLI flags over config-file values.
fn build_request(cli: &Cli, config: &FixIirConfig) -> Result<FixIirRequest, String> {
    let coeffb = coeff_list(cli.coeffb.as_deref(), cli.coeffb_values.as_deref())
        .ok_or("numerator coefficients required: --coeffb or --coeffb-values")?;
    let coeffa = coeff_list(cli.coeffa.as_deref(), cli.coeffa_values.as_deref())
        .ok_or("denominator coefficients required: --coeffa or --coeffa-values")?;

    let timeout = match cli.timeout.or(config.flopoco.timeout_secs) {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("invalid timeout {secs}: {e}"))?,
        ),
        None => None,
    };

    let mut request = FixIirRequest::new(
        coeffb,
        coeffa,
        cli.lsb_in.unwrap_or(config.filter.lsb_in),
        cli.lsb_out.unwrap_or(config.filter.lsb_out),
    );
    request.loglevel = cli.loglevel.unwrap_or(config.flopoco.loglevel);
    request.generate_figures = cli
        .generate_figures
        .unwrap_or(config.flopoco.generate_figures);
    request.flopoco_exe = cli
        .flopoco
        .clone()
        .or_else(|| config.flopoco.executable.clone());
    request.extra_args = config
        .flopoco
        .extra_args
        .iter()
        .chain(&cli.extra)
        .cloned()
        .collect();
    request.timeout = timeout;
    request.fallback_h = cli.fallback_h.or(config.filter.fallback_h);
    Ok(request)
}

fn coeff_list(literal: Option<&str>, values: Option<&[f64]>) -> Option<String> {
    match (literal, values) {
        (Some(list), _) => Some(list.to_string()),
        (None, Some(values)) => Some(coeffs::coeffs_to_hex_list(values)),
        (None, None) => None,
    }
}

fn format_metrics(m: &MetricsResult) -> String {
    let heps = match m.heps {
        Some(v) => format!("{v:?}"),
        None => "None".to_string(),
    };
    let mut out = format!("H={:?}\nHeps={}\nlsbExt={}", m.h, heps, m.lsb_ext);
    if m.timed_out {
        out.push_str("\ntimedOut=true");
    }
    out
}

fn print_dry_run(request: &FixIirRequest) {
    let program = runner::resolve_executable(request.flopoco_exe.as_deref());
    let cmd = CommandSpec::build(program, request);
    println!("{}", cmd.display());
    for (label, list) in [("coeffb", &request.coeffb), ("coeffa", &request.coeffa)] {
        match coeffs::parse_hex_list(list) {
            Ok(values) => println!("{label} = {values:?}"),
            Err(e) => println!("{label}: {e}"),
        }
    }
    if let Some(t) = request.timeout {
        println!("timeout = {}s", t.as_secs_f64());
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let request = match build_request(&cli, &config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    if cli.dry_run {
        print_dry_run(&request);
        return;
    }

    match runner::run_and_extract(&request).await {
        Ok(metrics) if cli.json => match serde_json::to_string_pretty(&metrics) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: failed to serialize metrics: {e}");
                std::process::exit(1);
            }
        },
        Ok(metrics) => println!("{}", format_metrics(&metrics)),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
