// src/server.rs
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::Config;
use crate::error::{EtudeError, EtudeResult};
use crate::reactor::Reactor;
use crate::syscalls;

/// A bound, not yet running, static-file server.
///
/// ```no_run
/// use etude_core::{Config, Server};
///
/// let server = Server::bind("127.0.0.1:8080", Config::default().doc_root("./html"))?;
/// server.shutdown_on_ctrl_c()?;
/// server.serve()?;
/// # Ok::<(), etude_core::EtudeError>(())
/// ```
pub struct Server {
    listener: TcpListener,
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Create the listening socket right away so the bound port is known
    /// before serving starts.
    pub fn bind(addr: &str, config: Config) -> EtudeResult<Self> {
        let listener = syscalls::create_listen_socket(addr, config.backlog)?;
        Ok(Self {
            listener,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Storing `true` stops [`Server::serve`] within one wake interval.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request shutdown on SIGINT.
    pub fn shutdown_on_ctrl_c(&self) -> EtudeResult<()> {
        let shutdown = Arc::clone(&self.shutdown);
        ctrlc::set_handler(move || {
            info!("received SIGINT, initiating graceful shutdown");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| EtudeError::Signal(e.to_string()))
    }

    /// Spawn the worker pool and run the reactor on the calling thread until
    /// shutdown.
    pub fn serve(self) -> EtudeResult<()> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            doc_root = %self.config.doc_root.display(),
            "etude listening"
        );

        let mut reactor = Reactor::new(self.listener, &self.config, self.shutdown)?;
        reactor.run()?;

        info!("etude server shut down successfully");
        Ok(())
    }
}
