//! Accept loops for the tunnel port and the public HTTP port

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::Broker;
use crate::handlers::{handle_connect, handle_forwarding};

/// Accept agent connections, one task per tunnel
pub async fn run_tunnel_server(listener: TcpListener, broker: Broker) {
    if let Ok(addr) = listener.local_addr() {
        info!("Tunnel server listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!("Accepted tunnel connection from {}", peer_addr);
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }

                let broker = broker.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connect(socket, peer_addr, broker).await {
                        warn!("Tunnel connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept tunnel connection: {}", e);
            }
        }
    }
}

/// Serve public HTTP/1.1 requests, one task per client connection
pub async fn run_ingress_server(listener: TcpListener, broker: Broker) {
    if let Ok(addr) = listener.local_addr() {
        info!("Ingress server listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let io = TokioIo::new(socket);
                let broker = broker.clone();

                tokio::spawn(async move {
                    let service =
                        service_fn(move |request| handle_forwarding(request, broker.clone()));
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Ingress connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept ingress connection: {}", e);
            }
        }
    }
}
