//! The HTTP server exposing collected metrics
//!
//! Every request to the metrics path runs one collection cycle and answers
//! with the resulting families in Prometheus text format, followed by the
//! exporter's own telemetry. Any other path gets a small landing page
//! pointing at the metrics path.

use std::{
    convert::Infallible, fmt, future::Future, net::SocketAddr, sync::Arc, time::Duration,
};

use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics_exporter_prometheus::PrometheusHandle;
use prometheus::{Encoder, TEXT_FORMAT, TextEncoder};
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{collector::Collector, fetch::StatsSource, telemetry};

/// How long in-flight connections may keep running after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors produced by [`Httpd`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct State<S> {
    collector: Collector<S>,
    metric_path: String,
    telemetry: Option<PrometheusHandle>,
}

impl<S> fmt::Debug for State<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("collector", &self.collector)
            .field("metric_path", &self.metric_path)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// The exporter's HTTP server.
#[derive(Debug)]
pub struct Httpd<S> {
    state: Arc<State<S>>,
    concurrency_limit: usize,
}

impl<S> Httpd<S>
where
    S: StatsSource + 'static,
{
    /// Create a new [`Httpd`]
    ///
    /// `telemetry`, when given, is rendered after the collected families on
    /// every metrics response.
    pub fn new(
        collector: Collector<S>,
        metric_path: String,
        telemetry: Option<PrometheusHandle>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            state: Arc::new(State {
                collector,
                metric_path,
                telemetry,
            }),
            concurrency_limit,
        }
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` cannot be bound.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections accepted on `listener` until `shutdown` resolves.
    ///
    /// Connections beyond the concurrency limit are dropped on accept. After
    /// shutdown, open connections get a short grace period before they are
    /// aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's address cannot be read.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Serving metrics on http://{}{}",
            listener.local_addr()?,
            self.state.metric_path
        );
        let mut connections = JoinSet::new();
        self.accept_until(&listener, shutdown, &mut connections)
            .await;
        drop(listener);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting connections still open after {SHUTDOWN_GRACE:?}");
            connections.shutdown().await;
        }
        Ok(())
    }

    // Accept and spawn connections into `connections` until `shutdown`
    // resolves. Finished connection tasks are reaped as the loop goes.
    async fn accept_until<F>(
        &self,
        listener: &TcpListener,
        shutdown: F,
        connections: &mut JoinSet<()>,
    ) where
        F: Future<Output = ()>,
    {
        let sem = Arc::new(Semaphore::new(self.concurrency_limit));

        pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {e}");
                    }
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let permit = match Arc::clone(&sem).try_acquire_owned() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            break;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("httpd over connection capacity, load shedding");
                            drop(stream);
                            continue;
                        }
                    };

                    let state = Arc::clone(&self.state);
                    connections.spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let state = Arc::clone(&state);
                            let path = req.uri().path().to_owned();
                            async move { Ok::<_, Infallible>(respond(&state, &path).await) }
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            error!("Error serving {addr}: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }
}

async fn respond<S>(state: &State<S>, path: &str) -> Response<Full<Bytes>>
where
    S: StatsSource,
{
    if path != state.metric_path {
        telemetry::record_request("landing");
        return response(
            StatusCode::OK,
            "text/html; charset=utf-8",
            landing_page(&state.metric_path),
        );
    }

    telemetry::record_request("metrics");
    let families = state.collector.collect().await;
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut body) {
        error!("Failed to encode metrics: {e}");
        return response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain; charset=utf-8",
            e.to_string(),
        );
    }
    if let Some(handle) = &state.telemetry {
        body.extend_from_slice(handle.render().as_bytes());
    }
    response(StatusCode::OK, TEXT_FORMAT, body)
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    resp
}

fn landing_page(metric_path: &str) -> String {
    format!(
        "<html>\n\
         <head><title>PowerDNS Exporter</title></head>\n\
         <body>\n\
         <h1>PowerDNS Exporter</h1>\n\
         <p><a href='{metric_path}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n"
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::{
        fetch::{self, StatEntry},
        registry::{Registry, ServerFlavor},
    };

    const RECURSOR_STATS: &str = include_str!("../fixtures/recursor_stats.json");

    #[derive(Debug)]
    struct Fixture;

    #[async_trait]
    impl StatsSource for Fixture {
        async fn fetch_stats(&self) -> Result<Vec<StatEntry>, fetch::Error> {
            Ok(serde_json::from_str(RECURSOR_STATS)?)
        }
    }

    fn collector() -> Collector<Fixture> {
        let flavor = ServerFlavor::Recursor;
        let registry = Registry::for_flavor(&flavor);
        Collector::new(Fixture, &flavor, registry).expect("valid instruments")
    }

    fn state(telemetry: Option<PrometheusHandle>) -> State<Fixture> {
        State {
            collector: collector(),
            metric_path: "/metrics".to_string(),
            telemetry,
        }
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp
            .into_body()
            .collect()
            .await
            .expect("infallible body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    #[tokio::test]
    async fn metrics_path_runs_a_cycle() {
        let state = state(None);
        let resp = respond(&state, "/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], TEXT_FORMAT);

        let body = body_string(resp).await;
        assert!(body.contains("powerdns_recursor_up 1\n"), "{body}");
        assert!(
            body.contains("powerdns_recursor_incoming_queries_total{net=\"tcp\"} 22\n"),
            "{body}"
        );
        assert!(
            body.contains("powerdns_recursor_response_time_seconds_bucket{le=\"+Inf\"} 6214\n"),
            "{body}"
        );
    }

    #[tokio::test]
    async fn telemetry_follows_the_collected_families() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || telemetry::record_request("landing"));

        let state = state(Some(handle));
        let body = body_string(respond(&state, "/metrics").await).await;

        let collected = body
            .find("powerdns_recursor_up 1\n")
            .expect("collected families present");
        let own = body
            .find(telemetry::HTTP_REQUESTS)
            .expect("telemetry present");
        assert!(collected < own, "{body}");
    }

    #[tokio::test]
    async fn other_paths_get_the_landing_page() {
        let state = state(None);
        let resp = respond(&state, "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("<a href='/metrics'>Metrics</a>"), "{body}");

        // the landing page does not scrape
        let families = state.collector.collect().await;
        let scrapes = families
            .iter()
            .find(|f| f.get_name() == "powerdns_recursor_exporter_total_scrapes")
            .map(|f| f.get_metric()[0].get_counter().get_value());
        assert_eq!(scrapes, Some(1.0));
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        let httpd = Httpd::new(collector(), "/metrics".to_string(), None, 4);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(httpd.serve(listener, async {
            let _ = stopped.await;
        }));

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .expect("client builds");
        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("request succeeds")
            .text()
            .await
            .expect("body readable");
        assert!(body.contains("# TYPE powerdns_recursor_cache_size gauge\n"), "{body}");

        stop.send(()).expect("server still running");
        server
            .await
            .expect("server task joins")
            .expect("server shuts down cleanly");
    }

    #[tokio::test]
    async fn finished_connections_are_reaped() {
        let httpd = Httpd::new(collector(), "/metrics".to_string(), None, 4);
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let mut connections = JoinSet::new();

        let accept = httpd.accept_until(
            &listener,
            async {
                let _ = stopped.await;
            },
            &mut connections,
        );
        let requests = async {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(0)
                .build()
                .expect("client builds");
            for _ in 0..20 {
                let resp = client
                    .get(format!("http://{addr}/"))
                    .send()
                    .await
                    .expect("request succeeds");
                assert_eq!(resp.status(), reqwest::StatusCode::OK);
                resp.text().await.expect("body readable");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.send(()).expect("still accepting");
        };
        tokio::join!(accept, requests);

        assert!(
            connections.len() <= 1,
            "{} finished connection tasks kept",
            connections.len()
        );
    }
}
