//! HTTP/1 front end for the image handler

use crate::handler::ImageHandler;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Accept loop dispatching every request to an [`ImageHandler`]
pub struct EdgeServer {
    handler: Arc<ImageHandler>,
    addr: SocketAddr,
}

impl EdgeServer {
    pub fn new(handler: Arc<ImageHandler>, addr: SocketAddr) -> Self {
        Self { handler, addr }
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("Image cache listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection from {}", peer);
            let io = TokioIo::new(stream);
            let handler = Arc::clone(&self.handler);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    // The body is dropped unread
                    let (parts, _body) = req.into_parts();
                    async move {
                        let response = handler
                            .handle(&parts.method, parts.uri.path(), &parts.headers)
                            .await;
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}
