//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// Conformance checks for Knative-style Kubernetes ingress implementations
#[derive(Parser, Debug)]
#[command(name = "ingress-conformance")]
#[command(version)]
#[command(about = "Provision backends, create ingresses and probe them")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Override the namespace for test resources
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Override the ingress class
    #[arg(long, global = true)]
    pub ingress_class: Option<String>,

    /// Dial this host's node ports instead of the ingress load balancer
    #[arg(long, global = true)]
    pub ingress_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a backend and an ingress, probe it, then tear everything down
    Smoke(SmokeArgs),

    /// Wait for an existing ingress to become ready
    Wait(WaitArgs),

    /// Probe an existing ready ingress through its load balancer
    Probe(ProbeArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for smoke command
#[derive(Parser, Debug)]
pub struct SmokeArgs {
    /// Also create a TLS secret and probe over HTTPS
    #[arg(long)]
    pub tls: bool,

    /// Name used to derive object names
    #[arg(long, default_value = "TestSmoke")]
    pub test_name: String,

    /// Leave the created objects in place
    #[arg(long)]
    pub keep: bool,
}

/// Arguments for wait command
#[derive(Parser, Debug)]
pub struct WaitArgs {
    /// Ingress name
    #[arg(long)]
    pub name: String,

    /// Wait timeout in seconds (defaults to the configured poll timeout)
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for probe command
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Ingress name
    #[arg(long)]
    pub name: String,

    /// URL to request; its host selects the ingress rule
    #[arg(long)]
    pub url: String,

    /// Accepted status codes
    #[arg(long, value_delimiter = ',', default_value = "200")]
    pub status: Vec<u16>,

    /// Treat a connection that cannot be dialed as success
    #[arg(long)]
    pub allow_dial_error: bool,

    /// Extra request header as NAME:VALUE
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Send this many plain GET requests expecting runtime info instead
    #[arg(long, default_value = "1")]
    pub count: usize,

    /// Requests in flight at once when --count is above one
    #[arg(long, default_value = "4")]
    pub concurrency: usize,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Show environment variables instead
        #[arg(long)]
        env: bool,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "./ingress-conformance.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// File to validate (defaults to the standard locations)
        #[arg(short, long)]
        file: Option<String>,
    },
}
