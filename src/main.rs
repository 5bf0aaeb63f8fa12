//! `evidence-check`: run one identification or comparison from the shell.
//!
//! **Usage:**
//! ```bash
//! evidence-check identify --kind plate capture.jpg
//! evidence-check compare --mode fuel-valve --current today.jpg --reference baseline.jpg
//! ```
//!
//! Prints one JSON document on stdout. Exit status: 0 GREEN or identifier
//! result, 2 YELLOW, 3 RED, 1 not evaluated (error JSON on stdout).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use thiserror::Error;

use fleet_evidence::config::{
    self, GatewayConfig, IdentifyFailureMode, PipelineOptions, DEFAULT_DEADLINE_SECS,
    DEFAULT_INFERENCE_URL, DEFAULT_VISION_MODEL,
};
use fleet_evidence::evidence_service::EvidenceService;
use fleet_evidence::pipeline::evidence::{
    AlertLevel, EvidenceError, EvidenceImage, IdentifierKind, InspectionMode,
};

/// Forensic evidence check against a vision model
#[derive(Parser, Debug)]
#[command(name = "evidence-check", version)]
#[command(about = "Identify fleet assets and compare inspection photos against their baseline")]
struct Cli {
    /// Inference endpoint (Ollama-compatible)
    #[arg(long, global = true, env = "EVIDENCE_INFERENCE_URL", default_value = DEFAULT_INFERENCE_URL)]
    url: String,

    /// Vision model name
    #[arg(long, global = true, env = "EVIDENCE_MODEL", default_value = DEFAULT_VISION_MODEL)]
    model: String,

    /// Bearer token for hosted endpoints
    #[arg(long, global = true, env = "EVIDENCE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Per-call deadline (seconds)
    #[arg(long, global = true, env = "EVIDENCE_DEADLINE_SECS", default_value_t = DEFAULT_DEADLINE_SECS)]
    deadline_secs: u64,

    /// Refuse non-loopback endpoints
    #[arg(long, global = true)]
    local_only: bool,

    /// Write prompts and raw model output here for auditing
    #[arg(long, global = true, env = "EVIDENCE_DUMP_DIR", value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    /// Total attempts on connection failures (1 = no retry)
    #[arg(long, global = true, default_value_t = 1)]
    attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a license plate or trailer number from one image
    Identify {
        #[arg(long, value_enum)]
        kind: KindArg,

        /// Report "not found" instead of failing when the model is unreachable
        #[arg(long)]
        soft_fail: bool,

        image: PathBuf,
    },
    /// Compare a current capture against its reference baseline
    Compare {
        #[arg(long, value_enum)]
        mode: ModeArg,

        #[arg(long, value_name = "IMAGE")]
        current: PathBuf,

        #[arg(long, value_name = "IMAGE")]
        reference: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Plate,
    Trailer,
}

impl From<KindArg> for IdentifierKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Plate => IdentifierKind::LicensePlate,
            KindArg::Trailer => IdentifierKind::TrailerNumber,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Tire,
    FuelValve,
}

impl From<ModeArg> for InspectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Tire => InspectionMode::TireIdentity,
            ModeArg::FuelValve => InspectionMode::FuelValveIntegrity,
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("Failed to serialize output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Evidence(e) => e.kind(),
            Self::Output(_) => "OUTPUT",
        }
    }
}

const EXIT_NOT_EVALUATED: u8 = 1;

fn exit_code_for(level: AlertLevel) -> u8 {
    match level {
        AlertLevel::Green => 0,
        AlertLevel::Yellow => 2,
        AlertLevel::Red => 3,
    }
}

async fn build_service(
    cli: &Cli,
    identify_failure: IdentifyFailureMode,
) -> Result<EvidenceService, CliError> {
    let gateway_config = GatewayConfig {
        base_url: cli.url.clone(),
        model: cli.model.clone(),
        api_key: cli.api_key.clone(),
        local_only: cli.local_only,
        ..GatewayConfig::default()
    };
    tracing::debug!(config = ?gateway_config, "Gateway configuration");

    let mut options = PipelineOptions::default()
        .with_deadline(Duration::from_secs(cli.deadline_secs))
        .with_identify_failure(identify_failure);
    if let Some(dir) = &cli.dump_dir {
        options = options.with_dump_dir(dir);
    }

    let service =
        EvidenceService::connect_with_retry(gateway_config, cli.attempts, options).await?;
    Ok(service)
}

async fn run(cli: &Cli) -> Result<(String, u8), CliError> {
    match &cli.command {
        Command::Identify {
            kind,
            soft_fail,
            image,
        } => {
            let failure_mode = if *soft_fail {
                IdentifyFailureMode::SoftFail
            } else {
                IdentifyFailureMode::Propagate
            };
            let service = build_service(cli, failure_mode).await?;
            let kind = IdentifierKind::from(*kind);
            let image = EvidenceImage::from_path(image)?;

            let identifier = service.identify(image, kind).await?;
            let output = serde_json::to_string_pretty(&json!({
                "kind": kind,
                "identifier": identifier,
            }))?;
            Ok((output, 0))
        }
        Command::Compare {
            mode,
            current,
            reference,
        } => {
            let service = build_service(cli, IdentifyFailureMode::Propagate).await?;
            let current = EvidenceImage::from_path(current)?;
            let reference = EvidenceImage::from_path(reference)?;

            let verdict = service
                .compare_evidence(InspectionMode::from(*mode), current, reference)
                .await?;
            let output = serde_json::to_string_pretty(&verdict)?;
            Ok((output, exit_code_for(verdict.alert_level)))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    fleet_evidence::init_tracing();
    tracing::debug!(app = config::APP_NAME, dev = config::is_dev(), "CLI starting");

    match run(&cli).await {
        Ok((output, code)) => {
            println!("{output}");
            ExitCode::from(code)
        }
        Err(e) => {
            tracing::error!(error = %e, "Evidence check not evaluated");
            println!(
                "{}",
                json!({ "evaluated": false, "error": e.kind(), "message": e.to_string() })
            );
            ExitCode::from(EXIT_NOT_EVALUATED)
        }
    }
}
