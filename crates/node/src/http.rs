//! Minimal health endpoint.
//!
//! Two read-only routes over a raw TCP listener:
//!
//! - `GET /health` — latest health report as JSON; 200 when healthy, 503
//!   when unhealthy or before the first check.
//! - `GET /ready` — plain-text readiness, 200 once a healthy report exists.
//!
//! Log serving and its authorization layer live in a separate collaborator;
//! this server never exposes flow data.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::health::HealthReport;

fn http_response(status_line: &str, content_type: &str, body: &str) -> String {
    format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn route(request: &str, health: &RwLock<Option<HealthReport>>) -> String {
    if request.contains("GET /health") {
        let report = health.read().clone();
        match report {
            Some(report) => {
                let status_line = if report.is_healthy() {
                    "HTTP/1.1 200 OK"
                } else {
                    "HTTP/1.1 503 Service Unavailable"
                };
                let body = serde_json::to_string(&report)
                    .unwrap_or_else(|_| r#"{"status":"unhealthy"}"#.to_string());
                http_response(status_line, "application/json", &body)
            }
            None => http_response(
                "HTTP/1.1 503 Service Unavailable",
                "application/json",
                r#"{"status":"starting"}"#,
            ),
        }
    } else if request.contains("GET /ready") {
        let ready = health.read().as_ref().map(HealthReport::is_healthy).unwrap_or(false);
        if ready {
            http_response("HTTP/1.1 200 OK", "text/plain", "OK")
        } else {
            http_response("HTTP/1.1 503 Service Unavailable", "text/plain", "Unavailable")
        }
    } else {
        http_response("HTTP/1.1 404 Not Found", "text/plain", "Not Found")
    }
}

/// Serve the health endpoint until the shutdown notify fires.
pub async fn serve_health(
    addr: SocketAddr,
    health: Arc<RwLock<Option<HealthReport>>>,
    shutdown: Arc<Notify>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind health endpoint on {addr}: {e}");
            return;
        }
    };
    info!("health endpoint available at http://{addr}/health");

    // pinned across iterations so a notify arriving mid-accept is not lost
    let notified = shutdown.notified();
    tokio::pin!(notified);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut socket, _)) => {
                        let health = health.clone();
                        tokio::spawn(async move {
                            let mut buf = [0u8; 1024];
                            if socket.read(&mut buf).await.is_err() {
                                return;
                            }
                            let request = String::from_utf8_lossy(&buf);
                            let response = route(&request, &health);
                            let _ = socket.write_all(response.as_bytes()).await;
                        });
                    }
                    Err(e) => warn!("health endpoint accept error: {e}"),
                }
            }
            _ = &mut notified => {
                info!("health endpoint shutting down");
                break;
            }
        }
    }
}
