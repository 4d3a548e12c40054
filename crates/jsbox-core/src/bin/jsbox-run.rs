use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use jsbox_core::{platform, Config, DisposePolicy, ExecutionRequest, Isolate, IsolateConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "jsbox_core=info,jsbox_run=info";

fn usage() -> String {
    let logging =
        format!("Logging is controlled by JSBOX_LOG or RUST_LOG (default {DEFAULT_LOG_FILTER}).");
    [
        "Usage:",
        "  jsbox-run [options] <script.js>",
        "  jsbox-run [options] --expr <source>",
        "  jsbox-run --help",
        "",
        "Options:",
        "  --config <path>        TOML or YAML configuration file",
        "  --profile <name>       configuration profile to apply",
        "  --timeout-ms <ms>      execution timeout",
        "  --max-heap-mb <mb>     isolate heap ceiling",
        "",
        logging.as_str(),
    ]
    .join("\n")
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_env("JSBOX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| match level {
            Some(level) => EnvFilter::new(format!("jsbox_core={level},jsbox_run={level}")),
            None => EnvFilter::new(DEFAULT_LOG_FILTER),
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> anyhow::Result<T> {
    let Some(value) = value else {
        anyhow::bail!("missing value for {flag}");
    };
    value.parse().map_err(|_| anyhow::anyhow!("invalid value for {flag}: {value}"))
}

fn run() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut profile: Option<String> = None;
    let mut timeout_ms: Option<u64> = None;
    let mut max_heap_mb: Option<usize> = None;
    let mut expr: Option<String> = None;
    let mut script: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("{}", usage());
                return Ok(());
            }
            "--config" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("missing value for --config");
                };
                config_path = Some(PathBuf::from(value));
            }
            "--profile" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("missing value for --profile");
                };
                profile = Some(value);
            }
            "--timeout-ms" => timeout_ms = Some(parse_number("--timeout-ms", args.next())?),
            "--max-heap-mb" => max_heap_mb = Some(parse_number("--max-heap-mb", args.next())?),
            "--expr" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("missing value for --expr");
                };
                expr = Some(value);
            }
            unknown if unknown.starts_with('-') => {
                anyhow::bail!("unknown argument: {unknown}\n\n{}", usage());
            }
            path => script = Some(PathBuf::from(path)),
        }
    }

    let file_config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_logging(file_config.logging_level());

    let mut config = IsolateConfig::default();
    file_config.apply(&mut config, profile.as_deref());
    if let Some(mb) = max_heap_mb {
        config.max_heap_mb = mb;
        config.initial_heap_mb = config.initial_heap_mb.min(mb.max(1));
    }
    if let Some(flags) = file_config.engine_flags() {
        platform::set_flags(&flags)?;
    }

    let source = match (expr, script) {
        (Some(expr), None) => expr,
        (None, Some(path)) => fs::read_to_string(&path)
            .map_err(|error| anyhow::anyhow!("failed to read {}: {error}", path.display()))?,
        (Some(_), Some(_)) => anyhow::bail!("pass either --expr or a script path, not both"),
        (None, None) => anyhow::bail!("missing script\n\n{}", usage()),
    };

    let isolate = Isolate::new(config)?;
    let context = isolate.create_context()?;
    let mut request = ExecutionRequest::eval(source);
    if let Some(ms) = timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    let result = context.execute(request)?;
    let rendered = serde_json::to_string_pretty(&result)?;
    println!("{rendered}");

    context.dispose();
    isolate.dispose(DisposePolicy::Wait)?;
    drop(context);
    drop(isolate);
    platform::shutdown()?;

    if !result.is_success() {
        std::process::exit(2);
    }
    Ok(())
}
