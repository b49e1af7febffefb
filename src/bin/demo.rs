//! Imports a module, looks up a few of its functions, and runs them concurrently on worker
//! threads sharing one call frame.
//!
//! Configuration is read from the TOML file named by `ENGINELOCK_CONFIG`, if set:
//!
//! ```toml
//! worker_name_prefix = "engine-worker"
//!
//! [demo]
//! module = "foo"
//! functions = ["print_odds", "print_even"]
//! limit = 50
//! ```

use std::env;
use std::fs;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use enginelock::dispatch::{dispatch_all, CallFrame, Invocable};
use enginelock::natives::{self, LineSink};
use enginelock::{EngineError, Runtime, RuntimeConfig};

const CONFIG_ENV: &str = "ENGINELOCK_CONFIG";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    module: String,
    functions: Vec<String>,
    limit: i64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            module: "foo".into(),
            functions: vec!["print_odds".into(), "print_even".into()],
            limit: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    #[serde(flatten)]
    runtime: RuntimeConfig,
    demo: DemoConfig,
}

fn load_config() -> anyhow::Result<Config> {
    match env::var_os(CONFIG_ENV) {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.to_string_lossy()))
        }
        None => Ok(Config::default()),
    }
}

fn init_tracing(fallback: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout belongs to the natives.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };
    init_tracing(config.runtime.log_filter.as_deref());

    if let Err(e) = run(&config) {
        eprintln!("{:#}", e);
        process::exit(1);
    }
}

/// Finalizes on every path, then hands back the first error.
fn run(config: &Config) -> anyhow::Result<()> {
    let mut rt = Runtime::initialize(config.runtime.clone())?;
    let sink: LineSink = Arc::new(|line: String| println!("{}", line));
    rt.interpreter().register_module(natives::counting_module("foo", sink));

    let outcome = drive(&mut rt, &config.demo);
    let finalized = rt.finalize();
    outcome?;
    let stats = finalized?;
    tracing::info!(created = stats.created, released = stats.released, live = stats.live, "reference ledger");
    Ok(())
}

fn drive(rt: &mut Runtime, demo: &DemoConfig) -> anyhow::Result<()> {
    let jobs = {
        let held = rt.held()?;
        let module = held.import(&demo.module)?;

        let mut invocables = Vec::with_capacity(demo.functions.len());
        for name in &demo.functions {
            let f = held.get_attr(&module, name)?;
            invocables.push(Arc::new(Invocable::new(held, f)?));
        }

        let args = held.make_tuple(1)?;
        held.tuple_set(&args, 0, held.make_int(demo.limit)?).map_err(EngineError::from)?;
        let frame = Arc::new(CallFrame::new(held, args, Some(held.make_mapping()?))?);

        invocables.into_iter().map(|f| (f, frame.clone())).collect::<Vec<_>>()
    };

    let results = dispatch_all(rt, &jobs)?;
    tracing::info!(invocations = results.len(), "all invocations finished");
    Ok(())
}
