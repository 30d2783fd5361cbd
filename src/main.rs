//! `rfsd` — remote filesystem RPC server.
//!
//! Exposes nine POSIX filesystem primitives (`open`, `close`, `read`,
//! `write`, `lseek`, `stat`, `unlink`, `getdirentries`, `getdirtree`) over a
//! length-prefixed binary protocol on TCP, executing them against the
//! server's own local filesystem on behalf of a remote client. See
//! [`rpc`] for the wire format and [`session`] for the per-connection
//! request loop.
//!
//! ## Configuration
//!
//! The listening port comes from the `serverport15440` environment
//! variable, defaulting to 15400 when unset or unparsable.
//!
//! ## Concurrency
//!
//! One Tokio task per accepted connection. Each task owns its own
//! file-descriptor table for the lifetime of the connection; there is no
//! state shared between sessions.

mod ops;
mod rpc;
mod session;

const DEFAULT_PORT: u16 = 15400;
const PORT_ENV_VAR: &str = "serverport15440";

fn server_port() -> u16 {
    std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[tokio::main]
async fn main() {
    let port = server_port();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    eprintln!(
        "rfsd v{} starting (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("rfsd: failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    eprintln!("rfsd: listening on {addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("rfsd: accept error: {e}");
                continue;
            }
        };

        eprintln!("rfsd: accepted connection from {peer}");
        tokio::spawn(async move {
            session::serve_connection(stream, peer).await;
        });
    }
}
