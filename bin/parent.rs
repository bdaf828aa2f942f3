//! Privileged binary: serves `ACTION`/`MATCH` requests arriving from the
//! unprivileged child over the control socket (§4.4, §6).

use std::sync::{Arc, LazyLock};

use empath_common::{internal, Signal};
use empath_ipc::{IpcServer, RequestHandler};
use empath_parent::ParentHandler;
use tokio::sync::broadcast;

static SHUTDOWN: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    internal!("received shutdown signal, draining in-flight requests");
    let _ = SHUTDOWN.send(Signal::Shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    empath_common::logging::init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "/etc/empath/empath.toml".to_string());
    let socket_path = args
        .next()
        .unwrap_or_else(|| empath_ipc::DEFAULT_CONTROL_SOCKET.to_string());

    let ruleset = Arc::new(empath_core::config::load_file(&config_path)?);
    internal!("loaded ruleset from {}", config_path);

    let handler: Arc<dyn RequestHandler> = Arc::new(ParentHandler::new(ruleset));
    let server = IpcServer::new(socket_path, handler);

    tokio::select! {
        result = server.serve(SHUTDOWN.subscribe()) => result?,
        () = wait_for_shutdown_signal() => {}
    }

    internal!("parent shut down");
    Ok(())
}
