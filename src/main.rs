mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use rf_core::config::Config;
use rf_core::{JobId, JobStatus};
use rf_pipeline::Runtime;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults based on --verbose.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelforge=trace,rf_core=trace,rf_store=debug,rf_pipeline=trace,rf_server=trace,tower_http=debug".to_string()
        } else {
            "reelforge=info,rf_core=info,rf_store=info,rf_pipeline=info,rf_server=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref());
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(rf_server::start(config))?;
            Ok(())
        }
        Commands::Run {
            job_id,
            topic,
            payload,
        } => {
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_job(config, &job_id, topic, payload.as_deref()))
        }
        Commands::Plan { job_id } => {
            let config = Config::load_or_default(cli.config.as_deref());
            plan(&config, &job_id)
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn build_payload(topic: Option<String>, raw: Option<&str>) -> Result<serde_json::Value> {
    let mut payload = match raw {
        Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let Some(map) = payload.as_object_mut() else {
        anyhow::bail!("--payload must be a JSON object");
    };
    if let Some(topic) = topic {
        map.insert("topic".into(), serde_json::Value::String(topic));
    }
    Ok(payload)
}

async fn run_job(
    config: Config,
    job_id: &str,
    topic: Option<String>,
    payload: Option<&str>,
) -> Result<()> {
    let job_id = JobId::parse(job_id)?;
    let payload = build_payload(topic, payload)?;
    let runtime = Runtime::build(&config).await?;

    let handle = runtime.orchestrator.start(job_id, payload).await?;
    tracing::info!(execution_id = %handle.execution_id, "Execution started");

    let job = tokio::select! {
        job = runtime.orchestrator.wait(&handle) => job?,
        _ = tokio::signal::ctrl_c() => {
            runtime.orchestrator.cancel(&handle)?;
            runtime.orchestrator.wait(&handle).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&job)?);

    if job.status != JobStatus::Succeeded {
        let reason = job
            .error()
            .map(|e| format!("{} at {}: {}", e.code, e.stage, e.message))
            .unwrap_or_default();
        anyhow::bail!("job {} ended {}: {reason}", job.job_id, job.status);
    }
    Ok(())
}

fn plan(config: &Config, job_id: &str) -> Result<()> {
    let job_id = JobId::parse(job_id)?;
    let definition = rf_pipeline::PipelineDefinition::standard(&config.pipeline)?;
    let scoper = rf_pipeline::CapabilityScoper::new(rf_pipeline::ResourceContext::new(
        &config.storage.bucket,
        &config.storage.region,
    ));

    for spec in definition.stages() {
        let model = if spec.model.is_container() {
            "container"
        } else {
            "function"
        };
        println!("{} ({model}, timeout {}s)", spec.name, spec.timeout.as_secs());
        for capability in scoper.scope(spec, &job_id)?.iter() {
            let actions: Vec<String> = capability.actions.iter().map(|a| a.to_string()).collect();
            println!(
                "  {:<16} {:<48} {}",
                capability.kind.to_string(),
                capability.pattern,
                actions.join(",")
            );
        }
    }
    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            Config::load(p).with_context(|| format!("failed to load {}", p.display()))?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    rf_pipeline::PipelineDefinition::standard(&config.pipeline)?;

    println!("Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Ledger: {:?}", config.ledger.backend);
    println!(
        "  Storage: {:?} (bucket {}, region {})",
        config.storage.backend, config.storage.bucket, config.storage.region
    );
    println!("  Functions: {:?}", config.functions.mode);
    println!("  Container: {}", config.container.program);
    println!("  Pipeline timeout: {}s", config.pipeline.timeout_secs);
    for warning in &warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}
