use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use node::api::ApiRuntime;
use node::config::{NodeConfig, ServiceKind};
use node::handler::{ApiHandlerRegistry, StageHandlerRegistry};
use node::mesh::{MeshTransport, RouteDispatcher};
use node::offload::AsyncPools;
use node::registry::NodeRegistry;
use node::session::{SessionContext, SessionRole, SessionTable};
use node::stage::StageRegistry;
use node::tls_util::TlsMaterial;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        dotenvy::from_filename("node/.env").ok();
    }
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    log::info!("starting playhouse node (protocol version {})", protocol::protocol_version());

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "node/config/node.toml".to_string());
    let config = Arc::new(NodeConfig::load_from_file(&config_path).unwrap_or_else(|e| {
        log::warn!("failed to load node config from '{config_path}': {e}. Using defaults.");
        NodeConfig::default()
    }));

    let self_node_id = config.node_id();
    let host = host_only(&config.bind_endpoint);
    let mesh_addr: SocketAddr = config.bind_endpoint.parse()?;
    let node_registry = NodeRegistry::from_entries(&config.registry);
    let pools = Arc::new(AsyncPools::init(config.pools.resolved_compute_concurrency(), config.pools.io_pool_concurrency));
    let sessions = Arc::new(SessionTable::new());
    let tls = Arc::new(TlsMaterial::load(config.transport.tls_cert_path.as_deref(), config.transport.tls_key_path.as_deref())?);

    let (mesh_transport, inbound_rx) = MeshTransport::bind(
        self_node_id.clone(),
        mesh_addr,
        &tls,
        node_registry.clone(),
        config.limits.send_queue_size,
    )
    .await?;
    log::info!("mesh transport bound on {mesh_addr}");

    let route_dispatcher = Arc::new(RouteDispatcher::new(
        self_node_id.clone(),
        mesh_transport,
        node_registry.clone(),
        config.timeouts.request_timeout(),
    ));
    route_dispatcher.attach_sessions(sessions.clone());

    let role = match config.service_id {
        ServiceKind::Play => {
            let stage_handlers = Arc::new(StageHandlerRegistry::new());
            let stage_registry = Arc::new(StageRegistry::new(
                stage_handlers,
                pools.clone(),
                node_registry.clone(),
                route_dispatcher.clone(),
                sessions.clone(),
                self_node_id.clone(),
                config.clone(),
            ));
            route_dispatcher.attach_play(stage_registry.clone());
            SessionRole::Play(stage_registry)
        }
        ServiceKind::Api => {
            let api_handlers = Arc::new(ApiHandlerRegistry::new());
            let api_runtime = Arc::new(ApiRuntime::new(
                api_handlers,
                route_dispatcher.clone(),
                node_registry.clone(),
                sessions.clone(),
                self_node_id.clone(),
            ));
            route_dispatcher.attach_api(api_runtime.clone());
            SessionRole::Api(api_runtime)
        }
    };

    route_dispatcher.spawn_inbound_loop(inbound_rx);

    let session_ctx = Arc::new(SessionContext { sessions: sessions.clone(), role, config: config.clone() });

    let mut listeners = Vec::new();

    if let Some(port) = config.transport.tcp_port {
        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        let ctx = session_ctx.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = node::transport::serve_tcp(addr, ctx).await {
                log::error!("tcp listener stopped: {e}");
            }
        }));
    }

    if let Some(port) = config.transport.tcp_tls_port {
        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        let ctx = session_ctx.clone();
        let tls = tls.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = node::transport::serve_tls(addr, tls, ctx).await {
                log::error!("tls listener stopped: {e}");
            }
        }));
    }

    if let Some(port) = config.transport.http_port {
        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        let ctx = session_ctx.clone();
        let ws_path = config.transport.websocket_path.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = node::transport::serve_ws(addr, &ws_path, ctx).await {
                log::error!("ws listener stopped: {e}");
            }
        }));
    }

    if let Some(port) = config.transport.https_port {
        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        let ctx = session_ctx.clone();
        let ws_path = config.transport.websocket_path.clone();
        let tls = tls.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = node::transport::serve_wss(addr, &ws_path, tls, ctx).await {
                log::error!("wss listener stopped: {e}");
            }
        }));
    }

    let cleanup_registry = node_registry.clone();
    let cleanup_nodes = cleanup_registry.nodes_for(protocol::ServiceId::Play)
        .into_iter()
        .chain(cleanup_registry.nodes_for(protocol::ServiceId::Api))
        .collect::<Vec<_>>();
    let cleanup_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let unreachable = cleanup_nodes.iter().filter(|n| !cleanup_registry.is_reachable(n)).count();
            if unreachable > 0 {
                log::debug!("registry health: {unreachable}/{} peers currently unreachable", cleanup_nodes.len());
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, stopping listeners");
    for handle in listeners {
        handle.abort();
    }
    cleanup_handle.abort();
    pools.shutdown();

    Ok(())
}

fn host_only(bind_endpoint: &str) -> &str {
    bind_endpoint.rsplit_once(':').map_or(bind_endpoint, |(host, _)| host)
}
