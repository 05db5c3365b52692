//! Observability endpoints.
//!
//! A deliberately small HTTP/1.1 responder on a plain `TcpListener`:
//! `GET /health` returns the fleet snapshot as JSON, `GET /metrics` returns
//! the text exposition of the metrics registry. Encoding beyond that is the
//! scraper's problem.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::health::HealthRegistry;
use crate::metrics::MetricsRegistry;
use crate::sink::SinkStatus;

pub struct ObservabilityServer {
    addr: String,
    health: HealthRegistry,
    sink: SinkStatus,
    metrics: MetricsRegistry,
    shutdown: watch::Receiver<bool>,
}

impl ObservabilityServer {
    pub fn new(
        addr: String,
        health: HealthRegistry,
        sink: SinkStatus,
        metrics: MetricsRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ObservabilityServer {
            addr,
            health,
            sink,
            metrics,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "observability endpoints listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "scrape connection");
                    let health = self.health.clone();
                    let sink = self.sink.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, health, sink, metrics).await {
                            debug!(error = %e, "scrape connection error");
                        }
                    });
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    health: HealthRegistry,
    sink: SinkStatus,
    metrics: MetricsRegistry,
) -> Result<(), std::io::Error> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let (method, path) = match request.parse(&buf[..n]) {
        Ok(_) => (
            request.method.unwrap_or(""),
            request.path.unwrap_or("/").to_string(),
        ),
        Err(_) => {
            write_response(&mut stream, 400, "text/plain", "bad request\n").await?;
            return Ok(());
        }
    };

    if method != "GET" {
        write_response(&mut stream, 405, "text/plain", "method not allowed\n").await?;
        return Ok(());
    }

    // strip any query string
    let path = path.split('?').next().unwrap_or("/");

    match path {
        "/health" => {
            let snapshot = health.fleet(sink.health());
            let body = serde_json::to_string_pretty(&snapshot)
                .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
            write_response(&mut stream, 200, "application/json", &body).await?;
        }
        "/metrics" => {
            let body = metrics.render();
            write_response(&mut stream, 200, "text/plain; version=0.0.4", &body).await?;
        }
        _ => {
            write_response(&mut stream, 404, "text/plain", "not found\n").await?;
        }
    }
    Ok(())
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<(), std::io::Error> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::sink::{BatchWriter, BatchWriterConfig, TimeSeriesSink};
    use std::sync::Arc;

    async fn start_server() -> (String, watch::Sender<bool>) {
        // bind first so the test knows the port
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let health = HealthRegistry::new(3, 10);
        health.record_success("dev-a", Duration::from_millis(3));
        let metrics = MetricsRegistry::new();
        metrics.counter("reads_total", "reads", &[("device", "dev-a")]).add(5);

        let (_bus, rx) = crate::bus::channel(8);
        let (writer, sink_status) = BatchWriter::new(
            Arc::new(crate::sink::LogSink) as Arc<dyn TimeSeriesSink>,
            BatchWriterConfig::default(),
            rx,
            &metrics,
        );
        drop(writer); // only the status handle is needed here

        let (tx, rx_shutdown) = watch::channel(false);
        let server = ObservabilityServer::new(
            addr.clone(),
            health,
            sink_status,
            metrics,
            rx_shutdown,
        );
        tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        (addr, tx)
    }

    async fn get(addr: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read");
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint_returns_fleet_json() {
        let (addr, _tx) = start_server().await;
        let response = get(&addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("application/json"));
        assert!(response.contains("\"device_id\": \"dev-a\""));
        assert!(response.contains("\"status\""));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_exposition() {
        let (addr, _tx) = start_server().await;
        let response = get(&addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("reads_total{device=\"dev-a\"} 5"));
        assert!(response.contains("# TYPE reads_total counter"));
    }

    #[tokio::test]
    async fn test_unknown_path_404() {
        let (addr, _tx) = start_server().await;
        let response = get(&addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_post_rejected_405() {
        let (addr, _tx) = start_server().await;
        let mut stream = TcpStream::connect(&addr).await.expect("connect");
        stream
            .write_all(b"POST /health HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .await
            .expect("write");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read");
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_query_string_ignored() {
        let (addr, _tx) = start_server().await;
        let response = get(&addr, "/metrics?format=text").await;
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (addr, tx) = start_server().await;
        tx.send(true).expect("signal");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // server has stopped accepting; a new connection should fail or hang
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            async {
                let mut s = TcpStream::connect(&addr).await?;
                s.write_all(b"GET /health HTTP/1.1\r\n\r\n").await?;
                let mut out = Vec::new();
                s.read_to_end(&mut out).await?;
                Ok::<_, std::io::Error>(out)
            },
        )
        .await;
        match result {
            Err(_) => {}                      // timed out — nothing served
            Ok(Err(_)) => {}                  // refused
            Ok(Ok(out)) => assert!(out.is_empty(), "server still answering after shutdown"),
        }
    }
}
