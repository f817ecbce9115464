//! Server side: accepts encrypted RTP traffic from any client, demultiplexes
//! it by SSRC into one outbound UDP flow per SSRC toward a fixed local
//! destination, and tunnels replies back tagged by the same SSRC.
//!
//! Each live SSRC owns one outbound [`UdpEndpoint`] plus a small reader task
//! that forwards datagrams arriving on that socket into a shared channel the
//! main loop selects on — message-passing instead of a lock, since the
//! number of live flows is dynamic and `tokio::select!` can't branch over a
//! variable set of futures directly.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use std::sync::Arc;

use crate::constants::UDP_MTU;
use crate::proto::rtp::RtpSocket;
use crate::proto::udp::UdpEndpoint;

/// Everything needed to start a server instance.
pub struct ServerOptions {
    pub listen_addr: String,
    pub listen_port: u16,
    pub dest_addr: String,
    pub dest_port: u16,
    pub key: String,
    pub timeout_secs: u64,
}

/// State for one live SSRC: the outbound socket to the forwarding
/// destination, its liveness flag, and a handle to stop its reader task.
struct Flow {
    endpoint: UdpEndpoint,
    active: bool,
    cancel: oneshot::Sender<()>,
}

/// Runs the server until interrupted by Ctrl-C or SIGTERM.
pub async fn run(opts: ServerOptions) -> anyhow::Result<()> {
    run_until(opts, shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_until(opts: ServerOptions, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let mut rtp = RtpSocket::listen(&opts.listen_addr, opts.listen_port, &opts.key).await?;

    log::info!(
        "server listening on {}, forwarding to {}:{}",
        rtp.local_addr()?,
        opts.dest_addr,
        opts.dest_port
    );

    let mut flows: HashMap<u32, Flow> = HashMap::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<(u32, Vec<u8>)>();

    let mut sweep = tokio::time::interval(Duration::from_secs(opts.timeout_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.tick().await;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = rtp.recv() => {
                let (data, ssrc) = result?;
                forward_to_destination(&opts, &mut flows, &tx, ssrc, &data).await;
            }
            Some((ssrc, data)) = rx.recv() => {
                if let Err(err) = rtp.send(&data, ssrc) {
                    log::warn!("failed to tunnel reply for SSRC #{}: {}", ssrc, err);
                }
            }
            result = rtp.writable(), if rtp.has_pending() => {
                result?;
                rtp.flush();
            }
            _ = sweep.tick() => {
                for ssrc in sweep_idle(&mut flows) {
                    if let Some(flow) = flows.remove(&ssrc) {
                        let _ = flow.cancel.send(());
                    }
                    rtp.close_stream(ssrc);
                }
            }
            _ = &mut shutdown => {
                log::info!("tunnel closed, farewell");
                return Ok(());
            }
        }
    }
}

/// Routes one decrypted tunnel datagram to its destination socket,
/// allocating a fresh outbound flow (and reader task) the first time an
/// SSRC is seen.
async fn forward_to_destination(
    opts: &ServerOptions,
    flows: &mut HashMap<u32, Flow>,
    tx: &mpsc::UnboundedSender<(u32, Vec<u8>)>,
    ssrc: u32,
    data: &[u8],
) {
    if let Some(flow) = flows.get_mut(&ssrc) {
        flow.active = true;
        if flow.endpoint.has_pending() {
            flow.endpoint.flush();
        }
        if let Err(err) = flow.endpoint.send(data) {
            log::warn!("failed to forward packet for SSRC #{}: {}", ssrc, err);
        }
        return;
    }

    let mut endpoint = match UdpEndpoint::connect(&opts.dest_addr, opts.dest_port).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            log::warn!("failed to open outbound flow for SSRC #{}: {}", ssrc, err);
            return;
        }
    };

    if let Err(err) = endpoint.send(data) {
        log::warn!("failed to forward initial packet for SSRC #{}: {}", ssrc, err);
    }

    let socket = endpoint.socket_handle();
    let remote = endpoint
        .remote_addr()
        .expect("endpoint just constructed via UdpEndpoint::connect always has a remote");
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(read_flow(socket, remote, ssrc, tx.clone(), cancel_rx));

    flows.insert(
        ssrc,
        Flow {
            endpoint,
            active: true,
            cancel: cancel_tx,
        },
    );
}

/// Reads datagrams arriving on one flow's outbound socket and forwards them,
/// tagged with `ssrc`, into the shared channel. Exits when told to cancel or
/// when the channel's receiver (the main loop) has gone away.
///
/// This socket is "connected" in the spec.md §4.2 sense: it remembers one
/// remote (`remote`), and a datagram from anyone else is silently dropped
/// rather than accepted as a reply, exactly as `UdpEndpoint::recv` does for
/// every other socket in this crate. `recv_from` is used instead of routing
/// through a `UdpEndpoint` here only because this reader lives in its own
/// spawned task, independent of the `UdpEndpoint` value the main loop holds
/// for sending — the source check is reimplemented, not skipped.
async fn read_flow(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: u32,
    tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; UDP_MTU];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        if from != remote {
                            log::debug!("flow #{} dropping packet from non-connected party {}", ssrc, from);
                            continue;
                        }
                        if tx.send((ssrc, buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        log::warn!("flow #{} reader stopped: {}", ssrc, err);
                        return;
                    }
                }
            }
            _ = &mut cancel => {
                return;
            }
        }
    }
}

/// Two-phase idle sweep: a flow touched since the last sweep survives with
/// its activity flag cleared; one that wasn't touched is reported for
/// eviction by the caller.
fn sweep_idle(flows: &mut HashMap<u32, Flow>) -> Vec<u32> {
    let mut evicted = Vec::new();

    for (ssrc, flow) in flows.iter_mut() {
        if flow.active {
            flow.active = false;
        } else {
            evicted.push(*ssrc);
        }
    }

    evicted
}
