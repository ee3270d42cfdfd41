use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;

/// Default fully-qualified method excluded from call logging.
pub const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

/// Runtime configuration for the `polykey-tonic-server` binary.
///
/// Every value can be passed as a CLI flag or read from the environment
/// (including a `.env` file in the working directory). The keepalive values
/// are operational policy; the defaults suit long-lived service-to-service
/// connections behind a load balancer.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "polykey-tonic-server",
    version,
    about = "gRPC host for the Polykey key service"
)]
pub struct CliArgs {
    /// Address to listen on, as `host:port`. A bare `:port` binds every
    /// interface.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub listen_addr: String,

    /// Seconds a connection with no open calls may stay without any I/O
    /// before the server closes it. `0` disables the idle check.
    ///
    /// Environment variable: `IDLE_TIMEOUT`
    #[arg(long, env = "IDLE_TIMEOUT", default_value_t = 300)]
    pub idle_timeout: u64,

    /// Seconds between HTTP/2 keepalive pings on an open connection.
    ///
    /// Environment variable: `KEEPALIVE_INTERVAL`
    #[arg(long, env = "KEEPALIVE_INTERVAL", default_value_t = 7200)]
    pub keepalive_interval: u64,

    /// Seconds to wait for a keepalive ping acknowledgement before the
    /// connection is declared dead.
    ///
    /// Environment variable: `KEEPALIVE_TIMEOUT`
    #[arg(long, env = "KEEPALIVE_TIMEOUT", default_value_t = 20)]
    pub keepalive_timeout: u64,

    /// Upper bound, in seconds, on how long in-flight calls may run once a
    /// shutdown has started. Remaining connections are closed afterwards.
    ///
    /// Environment variable: `DRAIN_TIMEOUT`
    #[arg(long, env = "DRAIN_TIMEOUT", default_value_t = 30)]
    pub drain_timeout: u64,

    /// Seconds between publishing NOT_SERVING and closing the listener, giving
    /// health probes time to observe the change.
    ///
    /// Environment variable: `SHUTDOWN_GRACE`
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 0)]
    pub shutdown_grace: u64,

    /// Fully-qualified methods (`/package.Service/Method`) that are served
    /// without call logging. Comma separated.
    ///
    /// Environment variable: `QUIET_METHODS`
    #[arg(
        long,
        env = "QUIET_METHODS",
        value_delimiter = ',',
        default_value = HEALTH_CHECK_METHOD
    )]
    pub quiet_methods: Vec<String>,

    /// Serve `grpc.reflection.v1.ServerReflection` for tooling such as
    /// `grpcurl`.
    ///
    /// Environment variable: `REFLECTION`
    #[arg(long, env = "REFLECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub reflection: bool,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Output format of the process-wide log subscriber.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human readable output for local development.
    Pretty,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub idle_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub drain_timeout: Duration,
    pub shutdown_grace: Duration,
    pub quiet_methods: Vec<String>,
    pub reflection: bool,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Configuration with production defaults listening on `listen_addr`.
    pub fn with_listen_addr(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: normalize_listen_addr(listen_addr.into()),
            idle_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Duration::from_secs(7200),
            keepalive_timeout: Duration::from_secs(20),
            drain_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::ZERO,
            quiet_methods: vec![HEALTH_CHECK_METHOD.to_string()],
            reflection: true,
            log_format: LogFormat::Json,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.listen_addr.trim().is_empty() {
            bail!("LISTEN_ADDR must not be empty");
        }

        if args.keepalive_interval == 0 {
            bail!("KEEPALIVE_INTERVAL must be greater than 0");
        }

        if args.keepalive_timeout == 0 {
            bail!("KEEPALIVE_TIMEOUT must be greater than 0");
        }

        let mut quiet_methods = Vec::with_capacity(args.quiet_methods.len());
        for method in args.quiet_methods {
            let method = method.trim();
            if method.is_empty() {
                continue;
            }
            if !is_method_path(method) {
                bail!("QUIET_METHODS entry `{method}` is not of the form /package.Service/Method");
            }
            quiet_methods.push(method.to_string());
        }

        Ok(Self {
            listen_addr: normalize_listen_addr(args.listen_addr),
            idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
            keepalive_interval: Duration::from_secs(args.keepalive_interval),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout),
            drain_timeout: Duration::from_secs(args.drain_timeout),
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            quiet_methods,
            reflection: args.reflection,
            log_format: args.log_format,
        })
    }
}

/// `:50051` is shorthand for every interface.
fn normalize_listen_addr(addr: String) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn is_method_path(method: &str) -> bool {
    method
        .strip_prefix('/')
        .and_then(|rest| rest.split_once('/'))
        .is_some_and(|(service, name)| !service.is_empty() && !name.is_empty() && !name.contains('/'))
}
