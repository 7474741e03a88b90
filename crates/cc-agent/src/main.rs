mod config;
mod identity;
mod inbox;

use std::path::PathBuf;
use std::sync::Arc;

use cc_client::community::CommunityManager;
use cc_client::delivery_report::DeliveryReports;
use cc_client::events::EventBus;
use cc_client::group::GroupFanout;
use cc_client::member_cache::GroupMemberCache;
use cc_client::pipeline::{DedupSets, MessagePipeline};
use cc_client::relay_client::ReqwestTransport;
use cc_client::retry_queue::{RetryQueue, RetryQueueConfig};
use cc_client::runtime::AgentRuntime;
use clap::Parser;
use config::AgentConfig;
use identity::{FileKeyStore, IdentityManager};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cc-agent", about = "Community messaging agent")]
struct Args {
    /// Path to a TOML config file. Falls back to CC_AGENT_* env vars if unset.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = match &args.config {
        Some(path) => AgentConfig::from_toml(path)?,
        None => AgentConfig::from_env()?,
    };
    config.validate()?;

    let keystore = FileKeyStore::new(&config.identity_key_path);
    let identity_manager = IdentityManager::load_or_generate(&keystore).await?;
    let identity = identity_manager.identity();

    let events = EventBus::new();
    events.subscribe(|event| info!(?event, "client event"));

    let settings = &config.settings;

    let community_manager = Arc::new(
        CommunityManager::<ReqwestTransport>::new(settings, identity.clone(), events.clone()).await,
    );

    let retry_queue = Arc::new(RetryQueue::new(
        RetryQueueConfig {
            max_len: settings.retry_queue_max,
            offsets: settings
                .retry_offsets_secs
                .iter()
                .map(|s| std::time::Duration::from_secs(*s))
                .collect(),
            max_attempts: settings.retry_max_attempts,
            horizon: std::time::Duration::from_secs(settings.retry_horizon_secs),
        },
        events.clone(),
    ));
    let delivery_reports = Arc::new(DeliveryReports::new(settings.delivery_report_cap));
    let dedup = Arc::new(DedupSets::new(settings.dedup_cap));
    let member_cache = Arc::new(GroupMemberCache::new(std::time::Duration::from_secs(
        settings.group_member_cache_ttl_secs,
    )));

    let pipeline = Arc::new(MessagePipeline::new(
        community_manager.clone(),
        retry_queue.clone(),
        delivery_reports,
        dedup,
        events.clone(),
        settings.agent_name.clone(),
        identity.clone(),
        member_cache.clone(),
        settings.p2p_delivery_timeout(),
        chrono::Duration::seconds(settings.contact_cache_stale_after_secs as i64),
    ));

    let group_fanout = Arc::new(GroupFanout::new(
        community_manager.clone(),
        member_cache,
        pipeline.clone(),
        settings.group_fanout_concurrency,
        settings.p2p_delivery_timeout(),
    ));

    let runtime = Arc::new(AgentRuntime::new(
        settings.clone(),
        community_manager.clone(),
        pipeline.clone(),
        group_fanout,
        retry_queue,
    ));
    runtime.start().await;

    let default_community = settings
        .default_community
        .clone()
        .or_else(|| community_manager.community_names().into_iter().next())
        .ok_or_else(|| anyhow::anyhow!("no community configured"))?;

    let inbox_state = inbox::InboxState {
        pipeline,
        default_community,
    };
    let app = inbox::router(inbox_state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("cc-agent inbox listening on {}", config.bind_addr);

    let serve = axum::serve(listener, app.into_make_service());
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
    }

    runtime.stop().await;
    Ok(())
}
