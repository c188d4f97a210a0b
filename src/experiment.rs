//! Mesh measurement experiment
//!
//! Forms a network on the leader, joins every router to it, pins the mesh
//! topology with MAC allowlists and then runs latency (ping) and throughput
//! (iperf3 over TCP and UDP) sweeps from each router towards the leader.
//! Counters and neighbour tables are logged on both ends after every run.

use crate::config::{Config, ExperimentConfig, IperfConfig, PingConfig, LEADER};
use crate::node::{NodeTimings, RemoteNode};
use crate::poll::poll_until;
use crate::session::CommandSession;
use crate::ssh::SshSession;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    fn label(self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

pub struct Experiment<S> {
    leader: RemoteNode<S>,
    routers: BTreeMap<String, RemoteNode<S>>,
    topology: BTreeMap<String, Vec<String>>,
    settings: ExperimentConfig,
    ping: PingConfig,
    iperf: IperfConfig,
    timing: NodeTimings,
    /// `ddmmyy` of the run, used in the network name and result files
    day: String,
}

impl Experiment<SshSession> {
    /// Connect to every configured node, leader first
    pub async fn connect(config: &Config, day: &str) -> Result<Self> {
        let nodes = config
            .nodes
            .as_ref()
            .context("Experiments need a [nodes] section")?;
        let leader = RemoteNode::connect(&nodes.leader, config.timing.clone())
            .await
            .context("Failed to connect to leader")?;

        let mut routers = BTreeMap::new();
        for (name, ssh) in &nodes.routers {
            let router = RemoteNode::connect(ssh, config.timing.clone())
                .await
                .with_context(|| format!("Failed to connect to router {}", name))?;
            routers.insert(name.clone(), router);
        }

        Ok(Self::new(leader, routers, config, day))
    }
}

impl<S: CommandSession> Experiment<S> {
    pub fn new(leader: RemoteNode<S>, routers: BTreeMap<String, RemoteNode<S>>, config: &Config, day: &str) -> Self {
        Self {
            leader,
            routers,
            topology: config.topology.clone(),
            settings: config.experiment.clone(),
            ping: config.ping.clone(),
            iperf: config.iperf.clone(),
            timing: config.timing.clone(),
            day: day.to_string(),
        }
    }

    pub fn network_name(&self) -> String {
        format!("{}-{}", self.settings.network_prefix, self.day)
    }

    fn node(&self, name: &str) -> Result<&RemoteNode<S>> {
        if name == LEADER {
            return Ok(&self.leader);
        }
        self.routers
            .get(name)
            .with_context(|| format!("Unknown node in topology: {}", name))
    }

    /// Form the mesh, pin its topology and record a baseline
    pub async fn setup(&mut self) -> Result<()> {
        let network_name = self.network_name();
        self.leader
            .form_network(&network_name)
            .await
            .context("Leader could not form the network")?;

        self.log_identity().await?;

        let tx_power = self.settings.tx_power_dbm;
        self.leader.set_tx_power(tx_power).await?;
        for router in self.routers.values() {
            router.set_tx_power(tx_power).await?;
        }
        info!(tx_power_dbm = tx_power, "Set TX power on all nodes");

        for (name, router) in self.routers.iter_mut() {
            router
                .join_network(&self.leader)
                .await
                .with_context(|| format!("Router {} could not join the network", name))?;
            wait_for_router_role(router, &self.timing).await?;
            log_addresses(router).await?;
        }
        info!("OpenThread network set up and all nodes joined");

        self.apply_topology().await?;

        tokio::time::sleep(Duration::from_secs(self.settings.allowlist_settle_secs)).await;
        self.log_all_diagnostics("After forming OT network").await;
        Ok(())
    }

    async fn log_identity(&self) -> Result<()> {
        let leader = &self.leader;
        let host = leader.hostname();
        log_addresses(leader).await?;
        let (key, panid, xpanid) = (leader.network_key()?, leader.panid()?, leader.xpanid()?);
        let (channel, frequency) = (leader.channel()?, leader.frequency()?);
        info!(host = %host, "OpenThread Network Key: {}", key);
        info!(host = %host, "OpenThread Network PAN: {}", panid);
        info!(host = %host, "OpenThread Network XPAN: {}", xpanid);
        info!(host = %host, "OpenThread Network Chan: {}", channel);
        info!(host = %host, "OpenThread Network Freq: {} kHz", frequency);
        Ok(())
    }

    /// Add allowlist entries per the topology map, then enable every allowlist
    async fn apply_topology(&self) -> Result<()> {
        for (name, neighbours) in &self.topology {
            let node = self.node(name)?;
            for neighbour in neighbours {
                node.add_maclist_entry(self.node(neighbour)?).await?;
            }
        }

        self.leader.enable_maclist().await?;
        for router in self.routers.values() {
            router.enable_maclist().await?;
        }
        info!("MAC allowlists set up and enabled");
        Ok(())
    }

    /// Every sweep enabled in the configuration, in order
    ///
    /// Ctrl+C ends the sweep in progress, or the next one when pressed
    /// between sweeps.
    pub async fn run_measurements(&self) -> Result<()> {
        let mut interrupts = Interrupts::listen();

        if self.settings.ping_tests {
            interrupts.run("ping", self.run_ping_sweep()).await?;
        }

        if self.settings.tcp_tests || self.settings.udp_tests {
            self.start_iperf_server().await?;
        }
        if self.settings.tcp_tests {
            interrupts.run("iperf3 TCP", self.run_iperf_sweep(Transport::Tcp)).await?;
        }
        if self.settings.udp_tests {
            interrupts.run("iperf3 UDP", self.run_iperf_sweep(Transport::Udp)).await?;
        }
        Ok(())
    }

    pub async fn run_ping_sweep(&self) -> Result<()> {
        info!("Running latency measurements using ping");
        let target = self.leader.ipv6_addr().await?.to_string();

        for router in self.routers.values() {
            let results = self.results_file("ping", router.hostname());
            for &size in &self.ping.packet_sizes {
                info!(host = %router.hostname(), "Pinging with a {} byte payload", size);
                let command = ping_command(self.ping.count, size, &target);
                let output = router.run(&command).await?;
                append_results(&results, &output).await?;

                self.log_pair_diagnostics(
                    router,
                    &format!("After receiving {} byte pings from {}", size, router.hostname()),
                    &format!("After pinging with {} byte payload", size),
                )
                .await;
                self.pause().await;
            }
        }

        info!("Finished latency tests");
        Ok(())
    }

    pub async fn start_iperf_server(&self) -> Result<()> {
        let log = format!("iperf3_server_{}.log", self.day);
        self.leader
            .run(&format!(
                "sudo iperf3 --server --daemon --verbose --port {} --logfile {}",
                self.iperf.port, log
            ))
            .await?;
        info!(host = %self.leader.hostname(), port = self.iperf.port, "iperf3 server started");
        Ok(())
    }

    pub async fn run_iperf_sweep(&self, transport: Transport) -> Result<()> {
        info!("Running throughput tests using {}", transport.label());
        let target = self.leader.ipv6_addr().await?.to_string();

        for router in self.routers.values() {
            let results = self.results_file("iperf3", router.hostname());
            for &length in &self.iperf.packet_sizes {
                for &bandwidth in &self.iperf.bandwidths {
                    info!(
                        host = %router.hostname(),
                        "Transmitting at {} bps with {} bytes over {}",
                        bandwidth,
                        length,
                        transport.label()
                    );
                    let command = iperf_command(&self.iperf, &target, bandwidth, length, transport);
                    let output = router.run(&command).await?;
                    append_results(&results, &output).await?;

                    self.log_pair_diagnostics(
                        router,
                        &format!(
                            "After {} with {} at {} bps from {}",
                            transport.label(),
                            length,
                            bandwidth,
                            router.hostname()
                        ),
                        &format!("After {} with {} at {} bps", transport.label(), length, bandwidth),
                    )
                    .await;
                    self.pause().await;
                }
            }
        }

        info!("Finished {} throughput tests", transport.label());
        Ok(())
    }

    /// Close every session, leader first
    pub async fn disconnect(self) {
        if let Err(e) = self.leader.disconnect().await {
            error!(error = %e, "Failed to disconnect leader");
        }
        for (name, router) in self.routers {
            if let Err(e) = router.disconnect().await {
                error!(router = %name, error = %e, "Failed to disconnect router");
            }
        }
        info!("Disconnected from all nodes");
    }

    fn results_file(&self, kind: &str, host: &str) -> PathBuf {
        self.settings
            .results_dir
            .join(format!("{}_{}_{}.log", kind, host, self.day))
    }

    async fn pause(&self) {
        tokio::time::sleep(Duration::from_secs(self.settings.pause_secs)).await;
    }

    async fn log_all_diagnostics(&self, label: &str) {
        log_diagnostics(&self.leader, label).await;
        for router in self.routers.values() {
            log_diagnostics(router, label).await;
        }
    }

    async fn log_pair_diagnostics(&self, router: &RemoteNode<S>, leader_label: &str, router_label: &str) {
        log_diagnostics(&self.leader, leader_label).await;
        log_diagnostics(router, router_label).await;
    }
}

async fn log_addresses<S: CommandSession>(node: &RemoteNode<S>) -> Result<()> {
    let ipv6 = node.ipv6_addr().await?;
    let ext = node.ext_hw_addr().await?;
    info!(host = %node.hostname(), "Mesh-local IPv6 address: {}", ipv6);
    info!(host = %node.hostname(), "Extended HW address: {}", ext);
    Ok(())
}

/// Poll until a freshly joined node has been promoted to router
async fn wait_for_router_role<S: CommandSession>(node: &RemoteNode<S>, timing: &NodeTimings) -> Result<()> {
    let promoted = poll_until(timing.poll_interval(), timing.join_timeout(), || async move {
        let node_type = node.node_type().await?;
        if !node_type.contains("router") {
            info!(host = %node.hostname(), node_type = %node_type, "Waiting for router promotion");
        }
        Ok::<_, crate::node::NodeError>(node_type.contains("router"))
    })
    .await?;

    if !promoted {
        anyhow::bail!(
            "{} was not promoted to router within {:?}",
            node.hostname(),
            timing.join_timeout()
        );
    }
    Ok(())
}

/// Counters and neighbour table, logging rather than failing on errors
async fn log_diagnostics<S: CommandSession>(node: &RemoteNode<S>, label: &str) {
    info!(host = %node.hostname(), "{}", label);
    if let Err(e) = node.log_counters().await {
        warn!(host = %node.hostname(), error = %e, "Could not read packet counters");
    }
    if let Err(e) = node.log_neighbor_table().await {
        warn!(host = %node.hostname(), error = %e, "Could not read neighbour table");
    }
}

/// Ctrl+C presses seen over the whole measurement phase
///
/// One listener outlives the individual sweeps, so a press that lands
/// between them is queued for the next sweep instead of being lost.
struct Interrupts {
    presses: mpsc::UnboundedReceiver<()>,
    listener: Option<JoinHandle<()>>,
}

impl Interrupts {
    fn listen() -> Self {
        let (tx, presses) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        Self {
            presses,
            listener: Some(listener),
        }
    }

    /// Run a sweep until it finishes or a press ends it early
    async fn run<F>(&mut self, label: &str, sweep: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        tokio::select! {
            result = sweep => result,
            Some(()) = self.presses.recv() => {
                warn!(sweep = label, "Received Ctrl+C, ending sweep early");
                Ok(())
            }
        }
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn ping_command(count: u32, size: u32, target: &str) -> String {
    format!("ping -6 -I wpan0 -c {} -s {} {}", count, size, target)
}

fn iperf_command(iperf: &IperfConfig, target: &str, bandwidth: u32, length: u32, transport: Transport) -> String {
    let mut command = format!(
        "sudo iperf3 --client {} --verbose --format k --port {} --bandwidth {} --length {} --time {}",
        target, iperf.port, bandwidth, length, iperf.duration_secs
    );
    if transport == Transport::Udp {
        command.push_str(" --udp");
    }
    command
}

async fn append_results(path: &Path, output: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open results file: {}", path.display()))?;
    file.write_all(output.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeSession;

    const CONFIG: &str = r#"
[experiment]
name = "two_nodes"
pause_secs = 1

[ping]
packet_sizes = [16, 32]
count = 3

[iperf]
port = 2607
duration_secs = 10
packet_sizes = [32]
bandwidths = [20000, 70000]

[nodes.leader]
host = "plutopi1.local"
username = "pi"

[nodes.routers.router1]
host = "plutopi2.local"
username = "pi"

[topology]
leader = ["router1"]
router1 = ["leader"]
"#;

    fn config(results_dir: &std::path::Path) -> Config {
        let mut config: Config = toml::from_str(CONFIG).unwrap();
        config.experiment.results_dir = results_dir.to_path_buf();
        config
    }

    fn leader_session() -> FakeSession {
        FakeSession::new("plutopi1.local")
            .reply("sudo wpanctl form ot-191026", "Successfully formed!")
            .reply("sudo wpanctl get Network:PANID", "Network:PANID = 0xFACE")
            .reply("sudo wpanctl get Network:XPANID", "Network:XPANID = 0x1122334455667788")
            .reply("sudo wpanctl get NCP:Channel", "NCP:Channel = 15")
            .reply("sudo wpanctl get NCP:Frequency", "NCP:Frequency = 2425000")
            .reply("sudo wpanctl get Network:Key", "Network:Key = [00112233445566778899AABBCCDDEEFF]")
            .reply("sudo wpanctl get IPv6:MeshLocalAddress", "IPv6:MeshLocalAddress = \"fd00::1\"")
            .reply("sudo wpanctl get NCP:ExtendedAddress", "NCP:ExtendedAddress = [CAFE000CAFE1111]")
    }

    fn router_session() -> FakeSession {
        FakeSession::new("plutopi2.local")
            .reply("sudo wpanctl get NCP:State", "NCP:State = \"associated\"")
            .reply("sudo wpanctl get Network:NodeType", "Network:NodeType = \"router\"")
            .reply("sudo wpanctl get IPv6:MeshLocalAddress", "IPv6:MeshLocalAddress = \"fd00::2\"")
            .reply("sudo wpanctl get NCP:ExtendedAddress", "NCP:ExtendedAddress = [CAFE000CAFE2222]")
            .reply("ping -6 -I wpan0 -c 3 -s 16 fd00::1", "3 packets transmitted, 3 received")
            .reply("ping -6 -I wpan0 -c 3 -s 32 fd00::1", "3 packets transmitted, 2 received")
    }

    async fn experiment(
        results_dir: &std::path::Path,
    ) -> (Experiment<FakeSession>, FakeSession, FakeSession) {
        let config = config(results_dir);
        let leader_session = leader_session();
        let router_session = router_session();
        let leader = RemoteNode::new(leader_session.clone(), config.timing.clone()).await;
        let router = RemoteNode::new(router_session.clone(), config.timing.clone()).await;
        let routers = BTreeMap::from([("router1".to_string(), router)]);
        let experiment = Experiment::new(leader, routers, &config, "191026");
        leader_session.clear_history();
        router_session.clear_history();
        (experiment, leader_session, router_session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_forms_joins_and_pins_topology() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, leader_session, router_session) = experiment(dir.path()).await;

        experiment.setup().await.unwrap();

        assert!(experiment.leader.is_joined());
        assert!(experiment.routers["router1"].is_joined());

        let leader_history = leader_session.history();
        assert!(leader_history.contains(&"sudo wpanctl form ot-191026".to_string()));
        assert!(leader_history.contains(&"sudo wpanctl set NCP:TXPower 8".to_string()));
        assert!(leader_history.contains(&"sudo wpanctl permit-join --network-wide".to_string()));
        assert!(leader_history.contains(&"sudo wpanctl add MAC:Allowlist:Entries CAFE000CAFE2222".to_string()));
        assert!(leader_history.contains(&"sudo wpanctl set MAC:Allowlist:Enabled true".to_string()));

        let router_history = router_session.history();
        assert!(router_history.contains(&"sudo wpanctl add MAC:Allowlist:Entries CAFE000CAFE1111".to_string()));
        assert!(router_history.contains(&"sudo wpanctl set MAC:Allowlist:Enabled true".to_string()));
        assert!(router_history.contains(&"sudo wpanctl get Thread:NeighborTable".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sweep_records_results() {
        let dir = tempfile::tempdir().unwrap();
        let (mut experiment, _, router_session) = experiment(dir.path()).await;
        experiment.setup().await.unwrap();
        router_session.clear_history();

        experiment.run_ping_sweep().await.unwrap();

        let history = router_session.history();
        assert!(history.contains(&"ping -6 -I wpan0 -c 3 -s 16 fd00::1".to_string()));
        assert!(history.contains(&"ping -6 -I wpan0 -c 3 -s 32 fd00::1".to_string()));

        let results = std::fs::read_to_string(dir.path().join("ping_plutopi2_191026.log")).unwrap();
        assert_eq!(
            results,
            "3 packets transmitted, 3 received\n3 packets transmitted, 2 received\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fails_when_leader_cannot_form() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let leader = RemoteNode::new(FakeSession::new("plutopi1.local"), config.timing.clone()).await;
        let mut experiment = Experiment::new(leader, BTreeMap::new(), &config, "191026");

        assert!(experiment.setup().await.is_err());
        assert!(!experiment.leader.is_joined());
    }

    fn interrupts() -> (Interrupts, mpsc::UnboundedSender<()>) {
        let (tx, presses) = mpsc::unbounded_channel();
        (Interrupts { presses, listener: None }, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_ends_running_sweep_only() {
        let (mut interrupts, tx) = interrupts();
        tx.send(()).unwrap();

        let interrupted = interrupts
            .run("long", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow::anyhow!("sweep should have been cut short"))
            })
            .await;
        assert!(interrupted.is_ok());

        let finished = interrupts.run("next", async { Ok(()) }).await;
        assert!(finished.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_between_sweeps_is_kept() {
        let (mut interrupts, tx) = interrupts();
        interrupts.run("first", async { Ok(()) }).await.unwrap();

        // pressed while no sweep was running
        tx.send(()).unwrap();

        let started = tokio::time::Instant::now();
        interrupts
            .run("second", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_error_still_propagates() {
        let (mut interrupts, _tx) = interrupts();
        let result = interrupts
            .run("failing", async { Err(anyhow::anyhow!("ssh dropped")) })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_iperf_commands() {
        let iperf = IperfConfig::default();
        assert_eq!(
            iperf_command(&iperf, "fd00::1", 20000, 32, Transport::Tcp),
            "sudo iperf3 --client fd00::1 --verbose --format k --port 2607 --bandwidth 20000 --length 32 --time 60"
        );
        assert!(iperf_command(&iperf, "fd00::1", 20000, 32, Transport::Udp).ends_with(" --udp"));
    }
}
