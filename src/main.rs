//! Loglet - log-forwarding sidecar injector and relay

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loglet::config::{
    IngestionConfig, InjectorConfig, RelayConfig, WebhookRegistration, WebhookServerConfig,
    DEFAULT_INGESTION_SERVER_NAME, DEFAULT_SERVICE_ACCOUNT, DEFAULT_WEBHOOK_PORT,
};
use loglet::controller::{error_policy, reconcile, Context};
use loglet::mutation::PodMutationHandler;
use loglet::rbac::{CredentialProvisioner, RbacClientImpl};
use loglet::relay::{BatchingIngestionClient, KubeLogSource, LogRelay};
use loglet::service_account::{SecretClientImpl, ServiceAccountVolumeResolver};
use loglet::sidecar::{env, INJECTED_LABEL};
use loglet::webhook::{self, registration::ensure_webhook_config, WebhookState};

/// Loglet - forwards pod logs to a log ingestion service through an injected sidecar
#[derive(Parser, Debug)]
#[command(name = "loglet", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission webhook and the owner controller
    ///
    /// Every pod created in the watched namespace gets a pod-scoped Role and
    /// RoleBinding and a log-forwarding sidecar.
    Webhook(WebhookArgs),

    /// Run the log relay (sidecar mode)
    ///
    /// Follows one container's logs and forwards them to the ingestion
    /// endpoint. Exits non-zero when the stream ends.
    Relay(RelayArgs),
}

/// Webhook mode arguments
#[derive(Args, Debug)]
struct WebhookArgs {
    /// Namespace whose pods receive the sidecar
    #[arg(long, env = "LOGLET_WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Port the HTTPS server listens on
    #[arg(long, env = "LOGLET_WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// PEM certificate served by the webhook
    #[arg(long, env = "LOGLET_WEBHOOK_CERT", default_value = "/etc/loglet/tls/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key for the served certificate
    #[arg(long, env = "LOGLET_WEBHOOK_KEY", default_value = "/etc/loglet/tls/tls.key")]
    tls_key: PathBuf,

    /// Sidecar image (empty for the default)
    #[arg(long, env = "LOGLET_SIDECAR_IMAGE")]
    sidecar_image: Option<String>,

    /// Ingestion endpoint (`host:port`) handed to every sidecar
    #[arg(long, env = "LOGLET_ENDPOINT", default_value = "")]
    ingestion_endpoint: String,

    /// Secret holding the ingestion CA, client certificate and key
    #[arg(long, env = "LOGLET_CERT_SECRET_NAME", default_value = "")]
    cert_secret_name: String,

    /// Service account bound to each pod's Role
    #[arg(long, env = "LOGLET_SERVICE_ACCOUNT", default_value = DEFAULT_SERVICE_ACCOUNT)]
    service_account: String,

    /// Mount the service account's token secret into the sidecar
    #[arg(long, env = "LOGLET_MOUNT_SERVICE_ACCOUNT_TOKEN")]
    mount_service_account_token: bool,

    /// Cluster name tagged on every record
    #[arg(long, env = "LOGLET_CLUSTER_NAME", default_value = "")]
    cluster_name: String,

    /// Service fronting the webhook; registers the webhook when set
    #[arg(long, env = "LOGLET_WEBHOOK_SERVICE")]
    webhook_service: Option<String>,

    /// Namespace of the webhook service
    #[arg(long, env = "LOGLET_WEBHOOK_SERVICE_NAMESPACE", default_value = "loglet-system")]
    webhook_service_namespace: String,

    /// Port of the webhook service
    #[arg(long, env = "LOGLET_WEBHOOK_SERVICE_PORT", default_value_t = 443)]
    webhook_service_port: i32,

    /// CA bundle that signed the webhook certificate
    #[arg(long, env = "LOGLET_WEBHOOK_CA_BUNDLE", default_value = "/etc/loglet/tls/ca.crt")]
    webhook_ca_bundle: PathBuf,
}

/// Relay mode arguments, written into the sidecar's environment at injection
#[derive(Args, Debug)]
struct RelayArgs {
    /// Namespace of the followed pod
    #[arg(long, env = env::NAMESPACE)]
    namespace: String,

    /// Followed pod
    #[arg(long, env = env::POD_NAME)]
    pod_name: String,

    /// Followed container
    #[arg(long, env = env::CONTAINER)]
    container: String,

    /// Source id for records
    #[arg(long, env = env::SOURCE_ID, default_value = "")]
    source_id: String,

    /// Instance id for records
    #[arg(long, env = env::INSTANCE_ID, default_value = "")]
    instance_id: String,

    /// Source type tag
    #[arg(long, env = env::SOURCE_TYPE, default_value = "")]
    source_type: String,

    /// Cluster tag
    #[arg(long, env = env::CLUSTER, default_value = "")]
    cluster: String,

    /// Ingestion endpoint (`host:port`)
    #[arg(long, env = env::ENDPOINT)]
    endpoint: String,

    /// Ingestion CA certificate
    #[arg(long, env = env::CA_PATH)]
    ca_path: PathBuf,

    /// Client certificate
    #[arg(long, env = env::CERT_PATH)]
    cert_path: PathBuf,

    /// Client private key
    #[arg(long, env = env::KEY_PATH)]
    key_path: PathBuf,

    /// Expected server name on the ingestion certificate
    #[arg(long, env = "LOGLET_SERVER_NAME", default_value = DEFAULT_INGESTION_SERVER_NAME)]
    server_name: String,

    /// Flush interval in milliseconds
    #[arg(long, env = "LOGLET_FLUSH_INTERVAL_MS", default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Kubeconfig to use instead of the in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both the webhook server and the ingestion client need a process-wide
    // crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Webhook(args) => run_webhook(args).await,
        Commands::Relay(args) => run_relay(args).await,
    }
}

/// Run the admission webhook alongside the owner controller
async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    let injector = InjectorConfig {
        ingestion_endpoint: args.ingestion_endpoint,
        cert_secret_name: args.cert_secret_name,
        service_account_name: args.service_account,
        mount_service_account_token: args.mount_service_account_token,
        cluster_name: args.cluster_name,
        ..Default::default()
    }
    .with_sidecar_image(args.sidecar_image);

    let server = WebhookServerConfig {
        namespace: args.namespace,
        listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port),
        tls_cert_path: args.tls_cert,
        tls_key_path: args.tls_key,
        registration: args.webhook_service.map(|service_name| WebhookRegistration {
            service_name,
            service_namespace: args.webhook_service_namespace,
            service_port: args.webhook_service_port,
            ca_bundle_path: args.webhook_ca_bundle,
        }),
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if let Some(registration) = &server.registration {
        ensure_webhook_config(&client, registration, &server.namespace)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register webhook: {}", e))?;
    }

    let provisioner = CredentialProvisioner::new(
        Arc::new(RbacClientImpl::new(client.clone())),
        injector.service_account_name.clone(),
    );
    let resolver = ServiceAccountVolumeResolver::new(Arc::new(SecretClientImpl::new(client.clone())));
    let mutator = PodMutationHandler::new(provisioner.clone(), resolver, injector);
    let state = Arc::new(WebhookState::new(Arc::new(mutator)));

    let pods: Api<Pod> = Api::namespaced(client, &server.namespace);
    let ctx = Arc::new(Context::new(provisioner));

    tracing::info!(namespace = %server.namespace, "Starting owner controller");
    let owner_controller = Controller::new(
        pods,
        WatcherConfig::default().labels(&format!("{INJECTED_LABEL}=true")),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "Pod reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "Pod reconciliation error");
            }
        }
    });

    tokio::select! {
        result = webhook::serve(&server, state) => {
            result.map_err(|e| anyhow::anyhow!("Webhook server failed: {}", e))?;
        }
        _ = owner_controller => {
            tracing::info!("Owner controller completed");
        }
    }

    Ok(())
}

/// Run one relay over the configured container's log stream
async fn run_relay(args: RelayArgs) -> anyhow::Result<()> {
    let config = RelayConfig {
        namespace: args.namespace,
        pod_name: args.pod_name,
        container: args.container,
        source_id: args.source_id,
        instance_id: args.instance_id,
        source_type: args.source_type,
        cluster: args.cluster,
        kubeconfig: args.kubeconfig,
        ingestion: IngestionConfig {
            endpoint: args.endpoint,
            ca_path: args.ca_path,
            cert_path: args.cert_path,
            key_path: args.key_path,
            server_name: args.server_name,
            flush_interval: Duration::from_millis(args.flush_interval_ms),
            ..Default::default()
        },
    };
    config.validate()?;

    let client = relay_client(&config).await?;
    let ingestion = BatchingIngestionClient::connect(&config.ingestion)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create ingestion client: {}", e))?;

    let relay = LogRelay::new(
        &config,
        Arc::new(KubeLogSource::new(client)),
        Arc::new(ingestion),
    );

    // A run only ends by failing; the supervisor restarts the sidecar
    relay
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Relay stopped: {}", e))
}

/// Kubernetes client from an explicit kubeconfig, or the in-cluster config
async fn relay_client(config: &RelayConfig) -> anyhow::Result<Client> {
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| anyhow::anyhow!("Invalid kubeconfig {:?}: {}", path, e))?
        }
        None => kube::Config::incluster()
            .map_err(|e| anyhow::anyhow!("Failed to load in-cluster config: {}", e))?,
    };
    Client::try_from(kube_config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}
