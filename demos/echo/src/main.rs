use tether::prelude::*;
use tether::transport::spawn_detached;

// ---------------------------------------------------------------------------
// Echo handlers
// ---------------------------------------------------------------------------

/// Sends every message on `conn` straight back. Stops once `conn` closes.
fn echo<C: Connection + Clone>(conn: &C) -> Subscription {
    let replier = conn.clone();
    conn.message().subscribe(move |data| {
        let replier = replier.clone();
        spawn_detached(async move {
            if let Err(e) = replier.send(data).await {
                tracing::debug!(error = %e, "echo dropped");
            }
        });
    })
}

/// Echoes on the session itself and on every channel the client opens.
fn serve(session: Session) {
    let id = session.id();
    tracing::info!(session = %id, "session opened");

    let host = Host::new(session.clone());
    let plain = echo(&host);
    let channels = host.connection().subscribe(move |channel: Channel| {
        tracing::info!(session = %id, channel = channel.id(), "channel opened");
        let subscription = echo(&channel);
        channel.closed().then(move |_| subscription.dispose());
    });

    let lost = session.broken_pipe().subscribe(move |reason| {
        tracing::info!(session = %id, code = reason.code, "link lost, holding session");
    });
    let resumed = session.resuming().subscribe(move |()| {
        tracing::info!(session = %id, "session resumed");
    });

    session.closed().then(move |event| {
        tracing::info!(session = %id, code = event.message.code, "session closed");
        for subscription in [plain, channels, lost, resumed] {
            subscription.dispose();
        }
        drop(host);
    });
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

struct EchoServer {
    server: TetherServer,
    _sessions: Subscription,
}

async fn start(addr: &str) -> Result<EchoServer, TetherError> {
    let server = TetherServer::builder().bind(addr).build().await?;
    let sessions = server.connection().subscribe(serve);
    Ok(EchoServer {
        server,
        _sessions: sessions,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let echo = start(&addr).await?;
    tracing::info!(addr = %echo.server.local_addr(), "echo server ready");

    tokio::signal::ctrl_c().await?;
    echo.server.shutdown();
    Ok(())
}
