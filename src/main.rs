use std::process;

use tiercache::{
    cache::CacheEngine,
    config::{self, Command, MatchArgs, PurgeArgs},
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Purge(args) => run_purge(&settings, args).await,
        Command::Match(args) => run_match(&settings, args),
    }
}

async fn run_purge(settings: &config::Settings, args: PurgeArgs) -> Result<(), InfraError> {
    let engine = CacheEngine::new(settings.cache.root.clone())?;

    if !engine.invalidate(&args.prefix).await {
        return Err(InfraError::maintenance(format!(
            "failed to purge `{}` under {}",
            args.prefix,
            engine.root().display()
        )));
    }

    info!(
        target = "tiercache::purge",
        prefix = %args.prefix,
        root = %engine.root().display(),
        "Purged cached bodies"
    );
    Ok(())
}

fn run_match(settings: &config::Settings, args: MatchArgs) -> Result<(), InfraError> {
    let registry = settings
        .cache
        .rule_registry()
        .map_err(|err| InfraError::configuration(err.to_string()))?;

    match registry.find_rule(&args.path) {
        Some(rule) => {
            let ttl = rule
                .ttl
                .map(|ttl| format!("{}s", ttl.as_secs()))
                .unwrap_or_else(|| "never expires".to_string());
            println!(
                "{} -> pattern `{}`, content type {}, ttl {}",
                args.path,
                rule.pattern.as_str(),
                rule.content_type,
                ttl
            );
        }
        None => println!("{} -> no rule", args.path),
    }
    Ok(())
}
