//! Plain HTTP server for the admission routes. TLS is terminated in front of it.

use std::net::SocketAddr;

use axum::Router;
use futures::{FutureExt as _, select};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to create {signal} listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },

    #[snafu(display("failed to serve admission requests"))]
    Serve { source: std::io::Error },
}

pub struct WebhookServer {
    router: Router,
    socket_addr: SocketAddr,
}

impl WebhookServer {
    pub fn new(router: Router, socket_addr: SocketAddr) -> Self {
        Self {
            router,
            socket_addr,
        }
    }

    /// Serves requests until SIGINT or SIGTERM is received.
    pub async fn run(self) -> Result<(), Error> {
        let mut sigint = signal(SignalKind::interrupt())
            .context(CreateSignalListenerSnafu { signal: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(CreateSignalListenerSnafu { signal: "SIGTERM" })?;
        tracing::debug!("created unix signal handlers");

        let shutdown = async move {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGINT");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGTERM");
                    }
                },
            };
        };

        let listener = TcpListener::bind(self.socket_addr)
            .await
            .context(BindTcpListenerSnafu {
                socket_addr: self.socket_addr,
            })?;
        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context(ServeSnafu)
    }
}
