use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use hostportal::{
    ContextConfig, NetReader, NetWriter, Op, OpConfig, PortalContext, Protocol, Status,
    TcpTransport,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "stress", version, author)]
/// Drive a portal with echo traffic and report what came back.
struct StressCli {
    /// Number of operations to push through the portal.
    #[arg(long, default_value_t = 1000)]
    count: usize,
    /// Payload size in bytes.
    #[arg(long, default_value_t = 64)]
    payload: usize,
    /// Workload units charged per operation.
    #[arg(long, default_value_t = 1)]
    workload: u64,
    /// Workload a connection carries before its sender blocks.
    #[arg(long, default_value_t = 16)]
    max_workload: u64,
    /// Echo endpoint host; an in-process echo server is used when omitted.
    #[arg(long)]
    host: Option<String>,
    /// Echo endpoint port; ignored when `--host` is omitted.
    #[arg(long, default_value_t = 7315)]
    port: u16,
}

/// One echo exchange: write the payload, read it back, compare.
struct EchoOp {
    payload: Bytes,
}

#[async_trait]
impl Protocol for EchoOp {
    async fn send_phase(&self, wire: &mut NetWriter) -> Status {
        match wire.write_all(&self.payload).await {
            Ok(()) => Status::Success,
            Err(_) => Status::Dead,
        }
    }

    async fn recv_phase(&self, wire: &mut NetReader) -> Status {
        let mut buf = vec![0u8; self.payload.len()];
        match wire.read_exact(&mut buf).await {
            Ok(_) if buf[..] == self.payload[..] => Status::Success,
            Ok(_) => Status::Error,
            Err(_) => Status::Dead,
        }
    }
}

/// Echo everything back, one task per accepted connection.
async fn echo_server() -> anyhow::Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind echo listener")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    Ok(addr)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = StressCli::parse();

    let (host, port) = match &cli.host {
        Some(host) => (host.clone(), cli.port),
        None => {
            let addr = echo_server().await?;
            info!(%addr, "started in-process echo server");
            (addr.ip().to_string(), addr.port())
        }
    };

    let ctx = PortalContext::new(
        Arc::new(TcpTransport),
        ContextConfig {
            max_workload: cli.max_workload,
            ..ContextConfig::default()
        },
    );
    let portal = ctx.portal(&host, port);
    let payload = Bytes::from(vec![0x5au8; cli.payload.max(1)]);

    let begin = Instant::now();
    let ops: Vec<Arc<Op>> = (0..cli.count)
        .map(|_| {
            Arc::new(Op::with_config(
                EchoOp {
                    payload: payload.clone(),
                },
                OpConfig {
                    workload: cli.workload,
                    ..OpConfig::default()
                },
            ))
        })
        .collect();
    for op in &ops {
        portal
            .submit(op.clone())
            .context("failed to submit operation")?;
    }

    let mut ok = 0usize;
    let mut failed = 0usize;
    for op in &ops {
        match op.completed().await {
            Status::Success => ok += 1,
            _ => failed += 1,
        }
    }
    let elapsed = begin.elapsed();

    let stats = portal.stats();
    println!(
        "{ok} ok, {failed} failed in {elapsed:.2?} ({:.0} ops/s)",
        ok as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "connections: {} attempts ({} failed), {} commands processed",
        stats.successful_conn_attempts + stats.failed_conn_attempts,
        stats.failed_conn_attempts,
        stats.cmds_processed
    );

    ctx.shutdown_all(false).await;
    ctx.wait_idle().await;
    Ok(())
}
