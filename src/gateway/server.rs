//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::AuthGateway;
use super::middleware::{MiddlewareState, RouteTable};
use super::router::{AppState, create_router};
use crate::config::{Config, RouteRule};
use crate::failsafe::EndpointClass;
use crate::{Error, Result};

/// HTTP server running the gateway middleware in front of its own endpoints
pub struct Server {
    config: Config,
    gateway: Arc<AuthGateway>,
}

impl Server {
    /// Create a server from validated configuration
    pub fn new(config: Config) -> Result<Self> {
        let gateway = Arc::new(AuthGateway::from_config(&config)?);
        Ok(Self { config, gateway })
    }

    /// The gateway behind this server
    #[must_use]
    pub fn gateway(&self) -> &Arc<AuthGateway> {
        &self.gateway
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.gateway.spawn_maintenance(&self.config, &shutdown_tx);

        let auth = Arc::new(MiddlewareState {
            gateway: Arc::clone(&self.gateway),
            routes: RouteTable::new(route_rules(&self.config)),
            trust_forwarded_for: self.config.server.trust_forwarded_for,
        });
        let state = Arc::new(AppState {
            gateway: Arc::clone(&self.gateway),
        });
        let app = create_router(state, auth);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("HIVE TRUST v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.gateway.local_issuer(), "Local tokens enabled");
        if self.config.remote.enabled {
            info!(
                mode = ?self.config.remote.mode,
                issuer = %self.config.remote.issuer,
                "Remote tokens enabled"
            );
        } else {
            info!("Remote tokens disabled");
        }
        if !self.config.revocation.enabled {
            warn!("REVOCATION disabled - revoked tokens stay valid until expiry");
        }
        if !self.config.rate_limit.enabled {
            warn!("RATE LIMITING disabled");
        }
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Configured rules plus a public `/health` unless one is configured
fn route_rules(config: &Config) -> Vec<RouteRule> {
    let mut rules = config.routes.clone();
    if !rules.iter().any(|r| r.prefix == "/health") {
        rules.push(RouteRule {
            prefix: "/health".to_string(),
            class: EndpointClass::default().to_string(),
            public: true,
            required_role: None,
        });
    }
    rules
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_is_public_by_default() {
        let rules = route_rules(&Config::default());
        let health = rules.iter().find(|r| r.prefix == "/health").unwrap();
        assert!(health.public);
    }

    #[test]
    fn test_configured_health_rule_is_kept() {
        let mut config = Config::default();
        config.routes.push(RouteRule {
            prefix: "/health".into(),
            class: "ops".into(),
            public: false,
            required_role: Some("ADMIN".into()),
        });

        let rules = route_rules(&config);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].class, "ops");
    }
}
