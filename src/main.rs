//! ingress-conformance - checks for Knative-style Kubernetes ingresses
//!
//! ## Usage
//!
//! ```bash
//! # Create a backend and an ingress, probe it, tear down
//! ingress-conformance smoke
//!
//! # Same over HTTPS with a generated certificate
//! ingress-conformance smoke --tls
//!
//! # Wait for an existing ingress and probe it
//! ingress-conformance wait --name my-ingress
//! ingress-conformance probe --name my-ingress --url http://foo.example.com/ --status 200,404
//!
//! # Write an example configuration file
//! ingress-conformance config init
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ingress_conformance::config::{env::print_env_help, ConfigFile, ConformanceConfig, EnvConfig};
use ingress_conformance::dial::create_dial_context;
use ingress_conformance::http::{
    runtime_request, runtime_request_with_expectations, runtime_requests, status_code_expectation,
    HttpClient, HttpRequest, RuntimeInfo,
};
use ingress_conformance::k8s::{
    create_ingress_ready, create_runtime_service, create_tls_secret, is_ingress_ready, IngressSpec,
    IngressTls, K8sClient, INGRESS_CRD_NAME, PORT_NAME_HTTP1,
};
use ingress_conformance::utils::logger::{init_logger, LogLevel};
use ingress_conformance::utils::timer::Stopwatch;
use ingress_conformance::TestContext;

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    init_logger(LogLevel::from_verbose(
        args.verbose || env.verbose.unwrap_or(false),
    ));

    if let Command::Config(config_args) = args.command {
        return manage_config(config_args, args.config.as_deref(), &env);
    }

    let config = load_config(&args, &env)?;

    match args.command {
        Command::Smoke(smoke_args) => run_smoke(config, smoke_args).await,
        Command::Wait(wait_args) => run_wait(config, wait_args).await,
        Command::Probe(probe_args) => run_probe(config, probe_args).await,
        Command::Config(_) => Ok(()),
    }
}

/// Defaults, then config file, then environment, then flags
fn load_config(args: &Args, env: &EnvConfig) -> Result<ConformanceConfig> {
    let (mut config, path) = ConformanceConfig::resolve(args.config.as_deref().map(Path::new), env)?;
    if let Some(path) = path {
        info!(path = %path.display(), "Loaded configuration");
    }

    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(class) = &args.ingress_class {
        config.ingress_class = class.clone();
    }
    if let Some(endpoint) = &args.ingress_endpoint {
        config.ingress_endpoint = Some(endpoint.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn connect() -> Result<K8sClient> {
    K8sClient::new()
        .await
        .context("Failed to create Kubernetes client")
}

async fn run_smoke(config: ConformanceConfig, args: cli::SmokeArgs) -> Result<()> {
    let client = connect().await?;
    if !client.ingress_crd_installed().await? {
        anyhow::bail!("CRD {INGRESS_CRD_NAME} is not installed in the cluster");
    }
    if !client.namespace_exists(&config.namespace).await? {
        anyhow::bail!("Namespace {} does not exist", config.namespace);
    }

    let ctx = TestContext::new(client, config, &args.test_name);
    let result = smoke(&ctx, args.tls).await;

    if args.keep {
        warn!(pending = ctx.pending_cleanups(), "Leaving test objects in place");
    } else if let Err(e) = ctx.teardown().await {
        warn!(error = %e, "Teardown did not complete");
    }

    let info = result.context("Smoke test failed")?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    println!("\n✓ Smoke test passed");
    Ok(())
}

async fn smoke(ctx: &TestContext, tls: bool) -> Result<RuntimeInfo> {
    let mut stopwatch = Stopwatch::new();
    let namespace = ctx.config().namespace.clone();

    let (service, port, _) = create_runtime_service(ctx, PORT_NAME_HTTP1).await?;
    stopwatch.lap("backend");

    let host = format!("{}.example.com", ctx.object_name());
    let mut spec = IngressSpec::single_backend(&host, &namespace, &service, port);

    let scheme = if tls {
        let (secret, _) = create_tls_secret(ctx, std::slice::from_ref(&host)).await?;
        spec = spec.with_tls(IngressTls {
            hosts: vec![host.clone()],
            secret_name: secret,
            secret_namespace: namespace.clone(),
        });
        stopwatch.lap("tls secret");
        "https"
    } else {
        "http"
    };

    let (ingress, client, _) = create_ingress_ready(ctx, spec).await?;
    stopwatch.lap("ingress ready");

    let info = runtime_request(&client, &format!("{scheme}://{host}/")).await?;
    stopwatch.lap("probe");

    info!(ingress = %ingress.name(), host = %host, "Ingress served the runtime backend");
    println!("Timings:\n{}\n", stopwatch.format());
    Ok(info)
}

async fn run_wait(config: ConformanceConfig, args: cli::WaitArgs) -> Result<()> {
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.poll_timeout());
    let interval = config.poll_interval();
    let ctx = TestContext::new(connect().await?, config, "wait");

    let ingress = ctx
        .ingresses()
        .wait_for_state(&args.name, is_ingress_ready, "ready", interval, timeout)
        .await?;

    println!("✓ Ingress {} is ready", ingress.name());
    if let Some(lb) = ingress.public_load_balancer() {
        let address = lb
            .domain_internal
            .as_deref()
            .or(lb.domain.as_deref())
            .or(lb.ip.as_deref())
            .unwrap_or("-");
        println!("  Public load balancer: {address}");
    }
    Ok(())
}

async fn run_probe(config: ConformanceConfig, args: cli::ProbeArgs) -> Result<()> {
    let ctx = TestContext::new(connect().await?, config, "probe");

    let ingress = ctx.ingresses().get(&args.name).await?;
    if !ingress.is_ready() {
        anyhow::bail!("Ingress {} is not ready", args.name);
    }

    let dialer = create_dial_context(ctx.client(), &ingress, ctx.config()).await?;
    let client = HttpClient::new(dialer, None)?
        .with_user_agent(format!("knative.dev/{}/{}", ctx.test_name(), ingress.name()))
        .with_timeout(ctx.config().request_timeout());

    if args.count > 1 {
        let results = runtime_requests(&client, &args.url, args.count, args.concurrency).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(info) => {
                    let uri = info.request.as_ref().map_or("-", |r| r.uri.as_str());
                    println!("  {:>4}  ✓ {uri}", i + 1);
                }
                Err(e) => println!("  {:>4}  ✗ {e}", i + 1),
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} of {} requests failed", args.count);
        }
        println!("✓ All {} requests succeeded", args.count);
        return Ok(());
    }

    let mut request = HttpRequest::get(&args.url);
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Invalid header {header:?}, expected NAME:VALUE"))?;
        request = request.header(name.trim(), value.trim())?;
    }

    let expectations = [status_code_expectation(args.status.iter().copied())];
    let info =
        runtime_request_with_expectations(&client, &request, &expectations, args.allow_dial_error)
            .await?;

    match info {
        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        None => println!("✓ Probe met expectations (no runtime payload)"),
    }
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, config_path: Option<&str>, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the file to customize your settings.");
        }

        cli::ConfigAction::Show { env: show_env, format } => {
            if show_env {
                env.print_summary();
                println!();
                print_env_help();
            } else {
                let (conformance, _) = ConformanceConfig::resolve(config_path.map(Path::new), env)?;
                let config = ConfigFile {
                    conformance,
                    ..Default::default()
                };
                let output = if format == "json" {
                    serde_json::to_string_pretty(&config)?
                } else {
                    serde_yaml::to_string(&config)?
                };
                println!("{output}");
            }
        }

        cli::ConfigAction::Validate { file } => {
            let path = file.or_else(|| config_path.map(str::to_string)).unwrap_or_else(|| {
                ConfigFile::find()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| "./ingress-conformance.yaml".to_string())
            });

            match ConfigFile::load(&path) {
                Ok(_) => {
                    println!("✓ Configuration file is valid: {path}");
                }
                Err(e) => {
                    println!("✗ Configuration file is invalid: {path}");
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
