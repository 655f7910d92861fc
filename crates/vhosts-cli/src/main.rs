#[cfg(unix)]
mod tun;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use vhosts_relay::HostsTable;

#[derive(Debug, Parser)]
#[command(about = "Answer DNS from a hosts table and relay UDP for an already-open tun device")]
struct Args {
    /// Hosts file (`/etc/hosts` syntax). Without it every DNS query is relayed upstream.
    #[arg(long, env = "VHOSTS_HOSTS")]
    hosts: Option<PathBuf>,

    /// Descriptor of the tun device, inherited from the parent process.
    #[arg(long, env = "VHOSTS_TUN_FD")]
    tun_fd: i32,

    /// Packet buffer size in bytes; must cover the tun MTU.
    #[arg(long, env = "VHOSTS_MTU", default_value_t = 16 * 1024)]
    mtu: usize,

    /// Maximum number of concurrently relayed UDP flows.
    #[arg(long, env = "VHOSTS_MAX_SESSIONS", default_value_t = 50)]
    max_sessions: usize,

    /// TTL of locally answered DNS records, in seconds.
    #[arg(long, env = "VHOSTS_DNS_TTL", default_value_t = 60)]
    dns_ttl: u32,

    /// `SO_MARK` applied to relay sockets so policy routing can keep them off the tun device.
    ///
    /// Without it, relay sockets are used as created.
    #[arg(long, env = "VHOSTS_FWMARK")]
    fwmark: Option<u32>,
}

fn load_hosts(path: Option<&Path>) -> Result<HostsTable> {
    let Some(path) = path else {
        return Ok(HostsTable::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read hosts file {}", path.display()))?;
    HostsTable::parse(&text).with_context(|| format!("invalid hosts file {}", path.display()))
}

#[cfg(unix)]
fn main() -> Result<()> {
    use std::sync::Arc;

    use vhosts_relay::{Engine, EngineConfig, NoProtection, SocketProtector};

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let hosts = load_hosts(args.hosts.as_deref())?;
    tracing::info!(entries = hosts.len(), "hosts table loaded");

    let config = EngineConfig {
        mtu: args.mtu,
        max_sessions: args.max_sessions,
        dns_ttl_secs: args.dns_ttl,
        ..Default::default()
    };

    let protector: Arc<dyn SocketProtector> = match args.fwmark {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        Some(mark) => Arc::new(vhosts_relay::FwMark(mark)),
        #[cfg(not(any(target_os = "android", target_os = "linux")))]
        Some(_) => anyhow::bail!("--fwmark is only supported on Linux"),
        None => Arc::new(NoProtection),
    };

    let iface = tun::TunFd::adopt(args.tun_fd)
        .with_context(|| format!("failed to adopt tun descriptor {}", args.tun_fd))?;
    let engine = Engine::start(config, hosts, Arc::new(iface), protector)
        .context("failed to start engine")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime.block_on(wait_for_exit(engine.lifecycle().subscribe()));

    let stats = engine.shutdown();
    tracing::info!(
        sessions = stats.sessions_created,
        evicted = stats.sessions_evicted,
        dns_answered = stats.dns_answered,
        packets_out = stats.packets_out,
        packets_in = stats.packets_in,
        dropped = stats.frames_dropped,
        "engine stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_exit(mut state: tokio::sync::watch::Receiver<vhosts_relay::State>) {
    use vhosts_relay::State;

    let ctrl_c = tokio::signal::ctrl_c();

    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown signal received"),
        _ = sigterm => tracing::info!("shutdown signal received"),
        _ = state.wait_for(|s| *s >= State::Draining) => {
            tracing::info!("engine stopped on its own");
        }
    }
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("vhosts needs an inherited tun descriptor, which requires a unix host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["vhosts", "--tun-fd", "3"]).unwrap();
        assert_eq!(args.tun_fd, 3);
        assert_eq!(args.mtu, 16 * 1024);
        assert_eq!(args.max_sessions, 50);
        assert_eq!(args.dns_ttl, 60);
        assert!(args.hosts.is_none());
        assert!(args.fwmark.is_none());
    }

    #[test]
    fn missing_hosts_file_means_empty_table() {
        assert!(load_hosts(None).unwrap().is_empty());
    }

    #[test]
    fn hosts_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0.0.0 ads.example.com").unwrap();
        let table = load_hosts(Some(file.path())).unwrap();
        assert_eq!(table.lookup("ads.example.com"), Some(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn bad_hosts_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bogus ads.example.com").unwrap();
        let err = load_hosts(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }
}
