use alias_pool::{Databases, Manager, MonitorConfig, PoolSettings, Registry, RetryPolicy};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Speaks a one-line PING/PONG protocol to a server.
pub struct TcpManager {
    addr: SocketAddr,
}

#[async_trait]
impl Manager for TcpManager {
    type Connection = BufReader<TcpStream>;
    type Error = io::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Ok(BufReader::new(TcpStream::connect(self.addr).await?))
    }

    async fn check(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.get_mut().write_all(b"PING\n").await?;
        let mut line = String::new();
        conn.read_line(&mut line).await?;
        if line.trim_end() != "PONG" {
            return Err(io::Error::new(io::ErrorKind::InvalidData, line));
        }
        Ok(())
    }

    fn is_fatal(&self, err: &Self::Error) -> bool {
        err.kind() == io::ErrorKind::PermissionDenied
    }
}

/// Stand-in database server.
async fn serve(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            while stream.read_line(&mut line).await.unwrap_or(0) > 0 {
                if line.trim_end() == "PING" && stream.get_mut().write_all(b"PONG\n").await.is_err() {
                    break;
                }
                line.clear();
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), alias_pool::Error> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    _ = tracing::subscriber::set_global_default(subscriber);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| alias_pool::Error::Config(e.to_string()))?;
    let addr = listener
        .local_addr()
        .map_err(|e| alias_pool::Error::Config(e.to_string()))?;
    tokio::spawn(serve(listener));

    let registry = Arc::new(Registry::new(move |_alias, _settings| Ok(TcpManager { addr })));
    let mut db = Databases::new(registry.clone(), RetryPolicy::new());
    db.configure(
        "default",
        PoolSettings::new()
            .with_min_connections(2)
            .with_max_connections(5)
            .with_max_overflow(2)
            .with_max_pool_age(Duration::from_secs(2)),
    )?;
    registry.start_monitor(MonitorConfig::new().with_interval(Duration::from_secs(1)));

    for round in 0..3 {
        let mut held = Vec::new();
        for _ in 0..7 {
            held.push(db.obtain_connection("default").await?);
        }
        if let Some(state) = db.pool_status("default") {
            info!(round, %state, "burst in flight");
        }
        for conn in held {
            db.release_connection("default", conn).await;
        }
        if let Some(state) = db.pool_status("default") {
            info!(round, %state, "burst released");
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }

    db.close_all().await;
    Ok(())
}
