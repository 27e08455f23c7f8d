use crate::{
    broker::{self, Broker, BrokerMetrics, StsClient, StsConfig},
    core::{duration::FlagDuration, Backoff, BaseArn, Dialect},
    index::{self, watch, Index},
    liveness,
    metrics::HttpMetrics,
    proxy, Passthrough, Proxy,
};
use anyhow::{bail, Result};
use clap::Parser;
use http::uri::Authority;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "metadata-proxy",
    about = "Serves workload-scoped IAM credentials on the instance metadata endpoint"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "metadata_proxy=info,warn",
        env = "METADATA_PROXY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8181")]
    proxy_addr: SocketAddr,

    /// Address of the real metadata service.
    #[clap(long, default_value = "169.254.169.254")]
    metadata_addr: Authority,

    /// Timeout for requests forwarded to the metadata service.
    #[clap(long, default_value = "10s")]
    metadata_timeout: FlagDuration,

    /// ARN prefix used to expand bare role names, e.g. `arn:aws:iam::123456789012:role/`.
    #[clap(long)]
    base_role_arn: Option<BaseArn>,

    /// Role served to workloads without a role annotation.
    #[clap(long)]
    default_role: Option<String>,

    #[clap(long, default_value = watch::DEFAULT_ROLE_KEY)]
    iam_role_key: String,

    #[clap(long, default_value = watch::DEFAULT_EXTERNAL_ID_KEY)]
    iam_external_id_key: String,

    /// Namespace annotation listing the roles its workloads may assume.
    #[clap(long, default_value = watch::DEFAULT_NAMESPACE_KEY)]
    namespace_key: String,

    /// Restricts the roles each namespace's workloads may assume.
    #[clap(long)]
    namespace_restrictions: bool,

    /// Pattern language of namespace allow-lists: `glob` or `regexp`.
    #[clap(long, default_value = "glob")]
    namespace_restriction_format: Dialect,

    #[clap(long, default_value = "15m")]
    iam_role_session_ttl: FlagDuration,

    /// Multiplies the session TTL to produce the credential lifetime requested from STS.
    #[clap(long, default_value = "2")]
    iam_role_session_ttl_ratio: u32,

    #[clap(long, default_value = "30s")]
    credential_cache_ttl: FlagDuration,

    /// First retry delay for STS calls and workload lookups.
    #[clap(long, default_value = "500ms")]
    backoff_initial_interval: FlagDuration,

    #[clap(long, default_value = "1s")]
    backoff_max_interval: FlagDuration,

    #[clap(long, default_value = "1s")]
    backoff_max_elapsed_time: FlagDuration,

    #[clap(long, default_value = "30s")]
    healthcheck_interval: FlagDuration,

    #[clap(long, default_value = "5s")]
    healthcheck_timeout: FlagDuration,

    /// Reported by `/healthz`.
    #[clap(long, env = "HOST_IP")]
    host_ip: Option<String>,

    /// Only index pods scheduled to this node.
    #[clap(long, env = "NODE_NAME")]
    node: Option<String>,

    /// Serves the index at `/debug/store`.
    #[clap(long)]
    debug: bool,

    #[clap(long)]
    use_regional_sts_endpoint: bool,

    /// An explicit STS endpoint, e.g. a VPC endpoint.
    #[clap(long)]
    sts_vpc_endpoint: Option<String>,

    #[clap(long, default_value = "5s")]
    sts_timeout: FlagDuration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            self.backoff_initial_interval.into(),
            self.backoff_max_interval.into(),
            self.backoff_max_elapsed_time.into(),
        )
    }

    pub async fn run(self) -> Result<()> {
        let backoff = self.backoff();
        let Self {
            log_level,
            log_format,
            client,
            admin,
            proxy_addr,
            metadata_addr,
            metadata_timeout,
            base_role_arn,
            default_role,
            iam_role_key,
            iam_external_id_key,
            namespace_key,
            namespace_restrictions,
            namespace_restriction_format,
            iam_role_session_ttl,
            iam_role_session_ttl_ratio,
            credential_cache_ttl,
            healthcheck_interval,
            healthcheck_timeout,
            host_ip,
            node,
            debug,
            use_regional_sts_endpoint,
            sts_vpc_endpoint,
            sts_timeout,
            ..
        } = self;

        if iam_role_session_ttl_ratio == 0 {
            bail!("--iam-role-session-ttl-ratio must be at least 1");
        }

        let base_arn = base_role_arn.unwrap_or_default();
        let default_role = default_role.map(|role| base_arn.role_arn(&role));

        let index = Index::shared(index::Config {
            default_role,
            namespace_restriction: namespace_restrictions,
        });

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("index"), index.clone());
        let broker_metrics = BrokerMetrics::register(prom.sub_registry_with_prefix("broker"));
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));
        let health_status = liveness::register(&mut prom);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Translate watches into index events, applied by a single task.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter = watch::Watcher::shared(
            watch::Annotations {
                role_key: iam_role_key,
                external_id_key: iam_external_id_key,
                namespace_key,
                dialect: namespace_restriction_format,
            },
            events_tx,
        );

        let pods_config = match node.as_deref() {
            Some(node) => {
                info!(%node, "Indexing pods on node");
                watcher::Config::default().fields(&format!("spec.nodeName={node}"))
            }
            None => watcher::Config::default(),
        };
        let pods = runtime.watch_all::<Pod>(pods_config);
        tokio::spawn(
            kubert::index::namespaced(adapter.clone(), pods).instrument(info_span!("pods")),
        );

        let namespaces = runtime.watch_all::<Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(adapter, namespaces).instrument(info_span!("namespaces")),
        );

        tokio::spawn(index::run(index.clone(), events_rx).instrument(info_span!("index")));

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let sts = StsClient::new(
            &sdk_config,
            StsConfig {
                regional: use_regional_sts_endpoint,
                vpc_endpoint: sts_vpc_endpoint,
                timeout: Some(sts_timeout.into()),
            },
        );
        info!(endpoint = sts.endpoint().unwrap_or("global"), "Using STS");
        let broker = Broker::new(
            Arc::new(sts),
            broker::Config {
                cache_ttl: credential_cache_ttl.into(),
                session_ttl: iam_role_session_ttl.into(),
                session_ttl_ratio: iam_role_session_ttl_ratio,
                backoff,
            },
            broker_metrics,
        );

        let (health_tx, health_rx) = liveness::channel();
        let prober = liveness::Prober::new(
            metadata_addr.clone(),
            healthcheck_timeout.into(),
            health_status,
        )?;
        tokio::spawn(
            prober
                .run(healthcheck_interval.into(), health_tx)
                .instrument(info_span!("liveness")),
        );

        let proxy = Proxy::new(
            proxy::Config {
                base_arn,
                host_ip: host_ip.unwrap_or_default(),
                debug,
                lookup_backoff: backoff,
            },
            index,
            broker,
            Passthrough::new(metadata_addr, metadata_timeout.into()),
            health_rx,
            http_metrics,
        );
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = crate::serve(proxy_addr, proxy, drain).await {
                tracing::error!(%error, "Metadata proxy failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
