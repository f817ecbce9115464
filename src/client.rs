//! Client side: listens for plain local UDP traffic, tunnels it over RTP to
//! a server, and demultiplexes replies back to the flow that originated them.
//!
//! One client instance serves many local peers ("flows") over a single RTP
//! socket connected to one server, each tagged by its own SSRC. The flow
//! table is a single owned map keyed by local address, plus a cheap reverse
//! index keyed by SSRC — there is exactly one place that owns `active`, so
//! the two tables can never disagree about which flows are live.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::constants::UDP_MTU;
use crate::proto::rtp::RtpSocket;
use crate::proto::udp::UdpEndpoint;

/// Everything needed to start a client instance.
pub struct ClientOptions {
    pub listen_addr: String,
    pub listen_port: u16,
    pub dest_addr: String,
    pub dest_port: u16,
    pub key: String,
    pub timeout_secs: u64,
}

struct Flow {
    ssrc: u32,
    active: bool,
}

/// Local-address ↔ SSRC flow table with a single source of truth for
/// liveness, plus an SSRC-keyed reverse index for the RTP receive path.
struct FlowTable {
    by_addr: HashMap<SocketAddr, Flow>,
    by_ssrc: HashMap<u32, SocketAddr>,
}

impl FlowTable {
    fn new() -> FlowTable {
        FlowTable {
            by_addr: HashMap::new(),
            by_ssrc: HashMap::new(),
        }
    }

    /// Returns the SSRC for `addr`, allocating one via `alloc` if this is a
    /// new flow. Marks the flow active either way.
    fn ssrc_for(&mut self, addr: SocketAddr, alloc: impl FnOnce() -> u32) -> u32 {
        if let Some(flow) = self.by_addr.get_mut(&addr) {
            flow.active = true;
            return flow.ssrc;
        }

        let ssrc = alloc();
        self.by_addr.insert(addr, Flow { ssrc, active: true });
        self.by_ssrc.insert(ssrc, addr);
        ssrc
    }

    /// Returns the local address for `ssrc`, marking the flow active if
    /// found.
    fn addr_for(&mut self, ssrc: u32) -> Option<SocketAddr> {
        let addr = *self.by_ssrc.get(&ssrc)?;
        if let Some(flow) = self.by_addr.get_mut(&addr) {
            flow.active = true;
        }
        Some(addr)
    }

    /// Two-phase idle sweep: a flow touched since the last sweep survives
    /// with its activity flag cleared; one that wasn't touched is evicted.
    /// Returns the SSRCs of evicted flows, for the caller to tear down.
    fn sweep(&mut self) -> Vec<u32> {
        let mut evicted = Vec::new();

        self.by_addr.retain(|_, flow| {
            if flow.active {
                flow.active = false;
                true
            } else {
                evicted.push(flow.ssrc);
                false
            }
        });

        for ssrc in &evicted {
            self.by_ssrc.remove(ssrc);
        }

        evicted
    }
}

/// Runs the client until interrupted by Ctrl-C or SIGTERM.
pub async fn run(opts: ClientOptions) -> anyhow::Result<()> {
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

async fn run_until(opts: ClientOptions, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let mut local = UdpEndpoint::listen(&opts.listen_addr, opts.listen_port).await?;
    let mut rtp = RtpSocket::connect(&opts.dest_addr, opts.dest_port, &opts.key).await?;

    log::info!(
        "client listening on {}, tunneling to {}:{}",
        local.local_addr()?,
        opts.dest_addr,
        opts.dest_port
    );

    let mut flows = FlowTable::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(opts.timeout_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.tick().await;

    let mut local_buf = vec![0u8; UDP_MTU];

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = local.recv(&mut local_buf) => {
                let (n, from) = result?;
                let ssrc = flows.ssrc_for(from, || rtp.random_ssrc());
                if let Err(err) = rtp.send(&local_buf[..n], ssrc) {
                    log::warn!("failed to tunnel datagram from {}: {}", from, err);
                }
            }
            result = rtp.recv() => {
                let (data, ssrc) = result?;
                match flows.addr_for(ssrc) {
                    Some(addr) => {
                        if let Err(err) = local.sendto(&data, addr) {
                            log::warn!("failed to deliver tunneled datagram to {}: {}", addr, err);
                        }
                    }
                    None => log::debug!("dropping packet for unknown SSRC #{}", ssrc),
                }
            }
            result = rtp.writable(), if rtp.has_pending() => {
                result?;
                rtp.flush();
            }
            result = local.writable(), if local.has_pending() => {
                result?;
                local.flush();
            }
            _ = sweep.tick() => {
                let evicted = flows.sweep();
                for ssrc in evicted {
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
