//! vendorfx CLI: learn and drive vendor audio-effect toggles.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;

use vendorfx::config::EngineConfig;
use vendorfx::endpoint::{EndpointKey, Flow};
use vendorfx::engine::Engine;
use vendorfx::learn::{CapturePrompt, LearnPhase, LearnSession, LearnTarget};
use vendorfx::paths::VendorFxPaths;
use vendorfx::reader::ReadMode;
use vendorfx::rules::{FxBody, Rule, ToggleKind};
use vendorfx::store::{JsonFileStore, Scope};

const CONFIRM_PHRASE: &str = "I UNDERSTAND";
const CONFIRM_ENV: &str = "VENDORFX_LEARN_CONFIRMED";

#[derive(Parser)]
#[command(name = "vendorfx", version, about = "Vendor audio-effect toggle engine")]
struct Cli {
    /// Rule file (default: $XDG_DATA_HOME/vendorfx/vendor_toggles.ini).
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// JSON store document (default: $XDG_DATA_HOME/vendorfx/store.json).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/vendorfx/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a rule describes the toggle on this endpoint.
    Supported {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Read the toggle's current state.
    State {
        #[command(flatten)]
        target: TargetArgs,

        /// Read only the most reliable record instead of the full quorum.
        #[arg(long)]
        fast: bool,
    },

    /// Turn the toggle on or off and verify.
    Set {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(value_enum)]
        state: Switch,
    },

    /// List every effect that applies to the endpoint.
    ListFx {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[arg(long)]
        fast: bool,
    },

    /// Learn a toggle from four guided captures.
    Learn {
        #[command(flatten)]
        target: TargetArgs,

        /// Friendly device name recorded in new FX rules.
        #[arg(long, default_value = "")]
        device_name: String,

        /// Skip the typed confirmation.
        #[arg(long)]
        yes: bool,

        /// Save progress here after each capture, and resume from it.
        #[arg(long)]
        session: Option<PathBuf>,
    },

    /// Remove the endpoint from every rule of the given kind.
    Delete {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// List loaded rules and skipped sections.
    Rules,

    /// Dump the endpoint's namespace as the learner sees it.
    Snapshot {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Show the effective configuration.
    Config {
        /// Write it to the config file.
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args)]
struct EndpointArgs {
    /// Device handle or bare `{guid}` endpoint key.
    #[arg(long)]
    device: String,

    #[arg(long, value_enum, default_value_t = FlowArg::Render)]
    flow: FlowArg,
}

impl EndpointArgs {
    fn resolve(&self) -> Result<(EndpointKey, Flow)> {
        Ok((EndpointKey::from_handle(&self.device)?, self.flow.into()))
    }
}

#[derive(Args)]
struct TargetArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Effect name; omit for the main enhancements switch.
    #[arg(long)]
    fx: Option<String>,
}

impl TargetArgs {
    fn resolve(&self) -> Result<(EndpointKey, Flow, ToggleKind)> {
        let (endpoint, flow) = self.endpoint.resolve()?;
        let kind = match &self.fx {
            Some(name) => ToggleKind::fx(name.trim()),
            None => ToggleKind::Main,
        };
        Ok((endpoint, flow, kind))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowArg {
    Render,
    Capture,
}

impl From<FlowArg> for Flow {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::Render => Flow::Render,
            FlowArg::Capture => Flow::Capture,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let paths = VendorFxPaths::resolve()?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = EngineConfig::load_or_default(&config_path)?;

    let rules_path = cli
        .rules
        .clone()
        .or_else(|| config.rules_path.clone())
        .unwrap_or_else(|| paths.rules_file());
    if cli.rules.is_none() || cli.store.is_none() {
        paths.ensure_dirs()?;
    }
    let store = JsonFileStore::open(cli.store.clone().unwrap_or_else(|| paths.store_file()))?;
    let engine = Engine::new(config, rules_path, &store);

    match cli.command {
        Commands::Supported { target } => {
            let (endpoint, flow, kind) = target.resolve()?;
            let supported = engine.is_supported(&endpoint, flow, &kind)?;
            if cli.json {
                print_json(&serde_json::json!({ "supported": supported }))?;
            } else {
                let verdict = if supported { "supported" } else { "not supported" };
                println!("{kind} on {endpoint} ({flow}): {verdict}");
            }
        }

        Commands::State { target, fast } => {
            let (endpoint, flow, kind) = target.resolve()?;
            let mode = if fast { ReadMode::Fast } else { ReadMode::Full };
            let report = engine.get_state(&endpoint, flow, &kind, mode)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{kind}: {} [{}{}]", report.state, report.source, scope_suffix(report.scope));
            }
        }

        Commands::Set { target, state } => {
            let (endpoint, flow, kind) = target.resolve()?;
            let report = engine.set_state(&endpoint, flow, &kind, matches!(state, Switch::On))?;
            if cli.json {
                print_json(&report)?;
            } else {
                let status = match (report.applied, report.verified) {
                    (true, true) => "applied and verified",
                    (true, false) => "applied, not verified",
                    _ => "not applied",
                };
                println!(
                    "{kind}: {status}, now {} [{}{}]",
                    report.state,
                    report.source,
                    scope_suffix(report.scope)
                );
                if report.blocks_skipped > 0 {
                    println!(
                        "  {} block(s) written, {} skipped",
                        report.blocks_written, report.blocks_skipped
                    );
                }
            }
        }

        Commands::ListFx { endpoint, fast } => {
            let (endpoint, flow) = endpoint.resolve()?;
            let mode = if fast { ReadMode::Fast } else { ReadMode::Full };
            let fx = engine.list_fx(&endpoint, flow, mode)?;
            if cli.json {
                print_json(&fx)?;
            } else if fx.is_empty() {
                println!("No effects apply to {endpoint} ({flow}).");
            } else {
                println!("Effects on {endpoint} ({flow}):");
                for row in &fx {
                    println!("  {:<24} {:<9} [{}]", row.name, row.state, row.source);
                }
            }
        }

        Commands::Learn {
            target,
            device_name,
            yes,
            session,
        } => {
            let (endpoint, flow, kind) = target.resolve()?;
            if !yes && !confirmed_by_env() && !confirm_learn()? {
                miette::bail!("learn not confirmed");
            }

            let target = LearnTarget {
                endpoint,
                flow,
                kind,
                device_name,
            };
            let mut learn = match &session {
                Some(path) if path.exists() => resume_session(path, &target)?,
                _ => LearnSession::new(target),
            };
            let mut prompt = StdinPrompt {
                store: &store,
                session_file: session.clone(),
            };
            let report = engine.resume_learn(&mut learn, &mut prompt)?;
            if let Some(path) = &session {
                std::fs::remove_file(path).into_diagnostic()?;
            }

            if cli.json {
                print_json(&report)?;
            } else {
                let how = if report.created { "created" } else { "updated" };
                println!(
                    "Learned {} record(s); {how} [{}] in {}",
                    report.blocks_found,
                    report.section,
                    engine.rules_path().display()
                );
            }
        }

        Commands::Delete { target } => {
            let (endpoint, _, kind) = target.resolve()?;
            let report = engine.delete_association(&endpoint, &kind)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("Removed {endpoint} from {} rule(s):", report.rules.len());
                for id in &report.rules {
                    println!("  [{id}]");
                }
            }
        }

        Commands::Rules => {
            let db = engine.rules()?;
            let rows: Vec<RuleRow> = db.rules().map(RuleRow::from).collect();
            let report = db.report();
            if cli.json {
                print_json(&serde_json::json!({ "rules": rows, "skipped": report.skipped }))?;
            } else {
                println!(
                    "{} ({} main, {} fx):",
                    engine.rules_path().display(),
                    report.main,
                    report.fx
                );
                for row in &rows {
                    let blocks = row.blocks.map(|n| format!(", {n} block(s)")).unwrap_or_default();
                    println!(
                        "  [{}] {}, {} device(s), {} excluded{blocks}",
                        row.section, row.kind, row.devices, row.excluded
                    );
                }
                if !report.skipped.is_empty() {
                    println!("Skipped sections ({}):", report.skipped.len());
                    for s in &report.skipped {
                        println!("  [{}] {}", s.section, s.message);
                    }
                }
            }
        }

        Commands::Snapshot { endpoint } => {
            let (endpoint, flow) = endpoint.resolve()?;
            let snapshot = engine.snapshot(&endpoint, flow);
            if cli.json {
                print_json(&snapshot)?;
            } else if snapshot.is_empty() {
                println!("No records under {endpoint} ({flow}).");
            } else {
                for record in &snapshot.records {
                    println!(
                        "{} = {} {}",
                        record.id,
                        record.value.kind(),
                        record.value.encode()
                    );
                }
            }
        }

        Commands::Config { write } => {
            if write {
                engine.config().save(&config_path)?;
                eprintln!("Wrote {}", config_path.display());
            }
            let text = if cli.json {
                serde_json::to_string_pretty(engine.config()).into_diagnostic()?
            } else {
                toml::to_string_pretty(engine.config()).into_diagnostic()?
            };
            println!("{text}");
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

fn scope_suffix(scope: Option<Scope>) -> String {
    scope.map(|s| format!(" {s}")).unwrap_or_default()
}

fn confirmed_by_env() -> bool {
    std::env::var(CONFIRM_ENV).is_ok_and(|v| v.trim() == "1")
}

fn confirm_learn() -> Result<bool> {
    eprintln!("Learning writes a new rule to the shared rule file and asks you to flip");
    eprintln!("the effect in the vendor control panel four times.");
    eprint!("Type {CONFIRM_PHRASE} to continue: ");
    std::io::stderr().flush().into_diagnostic()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).into_diagnostic()?;
    Ok(line.trim() == CONFIRM_PHRASE)
}

fn resume_session(path: &Path, target: &LearnTarget) -> Result<LearnSession> {
    let text = std::fs::read_to_string(path).into_diagnostic()?;
    let saved = LearnSession::from_json(&text)?;
    if saved.target != *target {
        miette::bail!(
            "session {} was started for a different target; remove it or pass matching flags",
            path.display()
        );
    }
    if matches!(saved.phase(), LearnPhase::Aborted | LearnPhase::Persisted) {
        return Ok(LearnSession::new(target.clone()));
    }
    eprintln!("Resuming learn at {}", saved.phase());
    Ok(saved)
}

/// Console prompt for the four captures. The store document is reloaded
/// after each confirmation so edits made by the driver are seen.
struct StdinPrompt<'a> {
    store: &'a JsonFileStore,
    session_file: Option<PathBuf>,
}

impl CapturePrompt for StdinPrompt<'_> {
    fn ready(&mut self, phase: LearnPhase) -> bool {
        let wanted = match phase.wants_enabled() {
            Some(true) => "ON",
            Some(false) => "OFF",
            None => return true,
        };
        eprint!("[{phase}] Turn the effect {wanted}, then press Enter (q to abort): ");
        if std::io::stderr().flush().is_err() {
            return false;
        }
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) if line.trim().eq_ignore_ascii_case("q") => return false,
            Ok(_) => {}
        }
        match self.store.reload() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "could not reload store before capture");
                false
            }
        }
    }

    fn captured(&mut self, session: &LearnSession) {
        let Some(path) = &self.session_file else {
            return;
        };
        let written = session
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(error) = written {
            tracing::warn!(path = %path.display(), %error, "could not save learn session");
        }
    }
}

/// One line of the `rules` listing.
#[derive(Serialize)]
struct RuleRow {
    section: String,
    kind: String,
    scopes: Vec<Scope>,
    flows: Vec<Flow>,
    devices: usize,
    excluded: usize,
    /// Write blocks of a multi-record rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<usize>,
}

impl From<&Rule> for RuleRow {
    fn from(rule: &Rule) -> Self {
        let view = rule.view();
        let (kind, blocks) = match rule {
            Rule::Main(_) => ("main".to_string(), None),
            Rule::Fx(fx) => {
                let blocks = match &fx.body {
                    FxBody::Multi(m) => Some(m.blocks.len()),
                    FxBody::Legacy(_) => None,
                };
                (format!("fx {}", fx.fx_name), blocks)
            }
        };
        Self {
            section: view.id().to_string(),
            kind,
            scopes: view.scopes().to_vec(),
            flows: view.flows().to_vec(),
            devices: view.membership().devices.len(),
            excluded: view.membership().excluded.len(),
            blocks,
        }
    }
}
