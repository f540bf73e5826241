//! Relay server implementation using hyper
//!
//! Accepts plain or TLS connections and hands every request to the relay
//! handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument};

use crate::error::{RelayError, Result};
use crate::relay::handler::RelayHandler;

/// Bind a listener, failing fast on a bad or busy address
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| RelayError::InvalidConfig(format!("Invalid listen address {}: {}", addr, e)))?;

    Ok(TcpListener::bind(addr).await?)
}

/// Relay server
#[derive(Clone)]
pub struct RelayServer {
    handler: Arc<RelayHandler>,
}

impl RelayServer {
    pub fn new(handler: Arc<RelayHandler>) -> Self {
        Self { handler }
    }

    /// Serve connections from `listener` until shutdown
    ///
    /// With `tls` set, every connection is TLS-terminated before HTTP parsing.
    #[instrument(skip(self, listener, tls, shutdown), fields(tls = tls.is_some()))]
    pub async fn run(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "Relay listening on {}://{}",
            if tls.is_some() { "https" } else { "http" },
            local_addr
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let tls = tls.clone();

                            tokio::spawn(async move {
                                let result = match tls {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(stream) => Self::handle_connection(stream, client_addr, handler).await,
                                        Err(e) => Err(RelayError::Tls(e.to_string())),
                                    },
                                    None => Self::handle_connection(stream, client_addr, handler).await,
                                };

                                if let Err(e) = result {
                                    debug!("Connection error from {}: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Relay listener on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection<S>(
        stream: S,
        client_addr: SocketAddr,
        handler: Arc<RelayHandler>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, client_addr).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| RelayError::Internal(format!("HTTP connection failed: {}", e)))?;

        Ok(())
    }
}
