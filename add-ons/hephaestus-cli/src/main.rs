//! `hephaestus` CLI: thin bindings from subcommands onto the shared service
//! facade. Exit codes: 0 success, 1 operation failure, 2 invalid arguments or
//! configuration, 3 authorization or safety refusal.

mod descriptors;

use clap::{Args, Parser, Subcommand};
use hephaestus_core::release::host::HttpReleaseHost;
use hephaestus_core::release::sigstore::{ExternalSigstoreVerifier, SigstoreVerifier};
use hephaestus_core::release::{ReleasePipeline, ReleaseRequest};
use hephaestus_core::{
    AssumeYes, AuditLog, AuditProtocol, CancelToken, CleanupOptions, ConfirmationSource,
    CoreConfig, GuardRailsOptions, Keystore, RunContext, ServiceState, TaskManager,
    TaskManagerConfig, TelemetrySink, Verifier,
};
use hephaestus_plugins::DiscoveryGateProvider;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hephaestus", version, about = "Developer guard-rails, cleanup, and verified release installs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the quality-gate pipeline over the workspace.
    GuardRails(GuardRailsArgs),
    /// Sweep workspace build caches and cruft with safety rails.
    Cleanup(CleanupArgs),
    /// Release artifact operations.
    #[command(subcommand)]
    Release(ReleaseCommand),
    /// Emit the command schema as JSON.
    Schema,
}

#[derive(Args)]
struct GuardRailsArgs {
    /// Workspace root.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Skip the formatting gate.
    #[arg(long = "no-format")]
    no_format: bool,
    /// Fail when declared tool versions drift from what is installed.
    #[arg(long)]
    drift: bool,
    /// Run discovered plugins instead of the legacy sequence.
    #[arg(long = "use-plugins")]
    use_plugins: bool,
}

#[derive(Args)]
struct CleanupArgs {
    /// Sweep root.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Additional explicit targets (repeatable).
    #[arg(long = "extra-path")]
    extra_paths: Vec<PathBuf>,
    /// Also sweep node_modules and the virtualenv.
    #[arg(long = "deep-clean")]
    deep_clean: bool,
    /// Preview only; delete nothing.
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Pre-approve targets outside the root.
    #[arg(long)]
    yes: bool,
    /// Write the cleanup report as JSON to this path.
    #[arg(long = "audit-manifest")]
    audit_manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ReleaseCommand {
    /// Download, verify, and install a release wheelhouse.
    Install(ReleaseInstallArgs),
}

#[derive(Args)]
struct ReleaseInstallArgs {
    /// Release repository, owner/name.
    #[arg(long)]
    repository: String,
    /// Release tag, or `latest`.
    #[arg(long, default_value = "latest")]
    tag: String,
    #[arg(long = "asset-pattern", default_value = "*wheelhouse*.tar.gz")]
    asset_pattern: String,
    #[arg(long = "manifest-pattern", default_value = "*wheelhouse*.sha256")]
    manifest_pattern: String,
    #[arg(long = "sigstore-pattern", default_value = "*.sigstore")]
    sigstore_pattern: String,
    /// Fail when no Sigstore bundle is published.
    #[arg(long = "require-sigstore")]
    require_sigstore: bool,
    /// Identity pin patterns the verified signer must match (repeatable).
    #[arg(long = "sigstore-identity")]
    sigstore_identities: Vec<String>,
    /// Proceed without a checksum manifest.
    #[arg(long = "allow-unsigned")]
    allow_unsigned: bool,
    /// Per-attempt network timeout in seconds.
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,
    /// Download attempts, including the first.
    #[arg(long = "max-retries", default_value_t = 3)]
    max_retries: u32,
    /// Install destination directory.
    #[arg(long, default_value = ".hephaestus/release")]
    destination: PathBuf,
}

/// Reads the confirmation channel: the literal string `CONFIRM` approves.
struct StdinConfirmation;

impl ConfirmationSource for StdinConfirmation {
    fn confirm(&self, summary: &str) -> bool {
        eprintln!("{summary}");
        eprintln!("Type CONFIRM to proceed:");
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(_) => line.trim() == "CONFIRM",
            Err(_) => false,
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    if let Command::Schema = cli.command {
        println!(
            "{}",
            serde_json::to_string_pretty(&descriptors::schema_json()).unwrap_or_default()
        );
        return 0;
    }

    let services = match build_services().await {
        Ok(services) => services,
        Err(message) => {
            eprintln!("hephaestus: {message}");
            return 2;
        }
    };
    let principal = std::env::var("USER").unwrap_or_else(|_| "local".to_string());

    match cli.command {
        Command::GuardRails(args) => guard_rails(&services, &principal, args).await,
        Command::Cleanup(args) => cleanup(&services, &principal, args).await,
        Command::Release(ReleaseCommand::Install(args)) => {
            release_install(&services, &principal, args).await
        }
        Command::Schema => unreachable!("handled above"),
    }
}

async fn build_services() -> Result<Arc<ServiceState>, String> {
    let config = CoreConfig::from_env();
    let telemetry = Arc::new(TelemetrySink::new(config.telemetry_enabled));
    let audit = Arc::new(AuditLog::new(&config.audit_log_dir));
    let keystore = Arc::new(
        Keystore::load(&config.service_account_keys_path).map_err(|e| e.to_string())?,
    );
    let verifier = Arc::new(Verifier::new(Arc::clone(&keystore)));
    let tasks = TaskManager::new(
        TaskManagerConfig {
            max_tasks: config.max_tasks,
            retention: config.task_retention,
            default_timeout: config.task_timeout,
            ..TaskManagerConfig::default()
        },
        Arc::clone(&telemetry),
    );

    let sigstore: Arc<dyn SigstoreVerifier> = Arc::new(ExternalSigstoreVerifier::from_env());
    let release = Arc::new(ReleasePipeline::new(
        Arc::new(HttpReleaseHost::new()),
        Arc::clone(&sigstore),
        Arc::clone(&telemetry),
    ));

    let workspace = std::env::current_dir().map_err(|e| e.to_string())?;
    let discovery =
        hephaestus_plugins::Discovery::for_workspace(&workspace, Arc::clone(&sigstore));
    let gate_provider = Arc::new(
        DiscoveryGateProvider::from_discovery(&discovery)
            .await
            .map_err(|e| e.to_string())?,
    );

    Ok(Arc::new(ServiceState {
        config,
        telemetry,
        audit,
        keystore,
        verifier,
        tasks,
        release,
        gate_provider,
    }))
}

async fn guard_rails(services: &Arc<ServiceState>, principal: &str, args: GuardRailsArgs) -> i32 {
    let options = GuardRailsOptions {
        workspace: args.workspace,
        skip_format: args.no_format,
        drift_check: args.drift,
        use_plugins: args.use_plugins,
        skip_cleanup: false,
    };
    let ctx = RunContext::new("guard-rails");
    let outcome = services
        .execute_guard_rails(
            &ctx,
            principal,
            AuditProtocol::Cli,
            &options,
            &CancelToken::new(),
            &|_f, _d| {},
        )
        .await;
    match outcome {
        Ok(result) => {
            for gate in &result.gates {
                let status = if gate.success { "ok" } else { "FAILED" };
                println!("{:<12} {:>8.2}s  {}  {}", gate.gate, gate.duration_s, status, gate.summary);
            }
            if result.success {
                println!("guard-rails passed in {:.2}s", result.duration_s);
                0
            } else {
                eprintln!("guard-rails failed after {:.2}s", result.duration_s);
                1
            }
        }
        Err(e) => {
            eprintln!("hephaestus: {e}");
            e.exit_code()
        }
    }
}

async fn cleanup(services: &Arc<ServiceState>, principal: &str, args: CleanupArgs) -> i32 {
    let mut options = if args.deep_clean {
        CleanupOptions::deep_clean(&args.root)
    } else {
        CleanupOptions::new(&args.root)
    };
    options.extra_paths = args.extra_paths;
    options.dry_run = args.dry_run;
    options.audit_manifest_path = args.audit_manifest;

    let confirmation: Box<dyn ConfirmationSource> = if args.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(StdinConfirmation)
    };
    let ctx = RunContext::new("cleanup");
    let outcome = services
        .execute_cleanup(
            &ctx,
            principal,
            AuditProtocol::Cli,
            &options,
            confirmation.as_ref(),
            &CancelToken::new(),
            &|_f, _d| {},
        )
        .await;
    match outcome {
        Ok(report) => {
            for entry in &report.entries {
                let reason = entry.reason.as_deref().unwrap_or("");
                println!("{:?}  {}  {}", entry.action, entry.path.display(), reason);
            }
            println!(
                "cleanup: {} removed, {} skipped, {} errors",
                report.removed, report.skipped, report.errors
            );
            if report.errors > 0 && report.removed == 0 && !options.dry_run {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("hephaestus: {e}");
            e.exit_code()
        }
    }
}

async fn release_install(
    services: &Arc<ServiceState>,
    principal: &str,
    args: ReleaseInstallArgs,
) -> i32 {
    let mut request = ReleaseRequest::new(args.repository, args.destination);
    request.tag = args.tag;
    request.asset_pattern = args.asset_pattern;
    request.manifest_pattern = args.manifest_pattern;
    request.sigstore_pattern = args.sigstore_pattern;
    request.require_sigstore = args.require_sigstore;
    request.sigstore_identities = args.sigstore_identities;
    request.allow_unsigned = args.allow_unsigned;
    request.timeout_s = args.timeout;
    request.max_retries = args.max_retries;
    request.token = services.config.github_token.clone();

    let ctx = RunContext::new("release-install");
    let outcome = services
        .execute_release(
            &ctx,
            principal,
            AuditProtocol::Cli,
            &request,
            &CancelToken::new(),
            &|_f, _d| {},
        )
        .await;
    match outcome {
        Ok(installed) => {
            println!(
                "installed {} ({} wheels) from {}: sha256 {}",
                installed.tag,
                installed.wheels_installed,
                installed.asset.name,
                installed.asset.sha256
            );
            if let Some(verdict) = &installed.asset.sigstore_verdict {
                println!("attested by {} via {}", verdict.subject, verdict.issuer);
            }
            0
        }
        Err(e) => {
            eprintln!("hephaestus: {e}");
            e.exit_code()
        }
    }
}
