//! Entity, radio and station model of the mesh topology under test.
//!
//! Entities are logical mesh devices (one controller, several agents), each
//! identified by a single hardware address whatever its radio count. An entity
//! is observed through a backend command runner and a log source; a radio has
//! its own per-interface log. Tests drive operations on entities and then
//! `wait_for_log` to confirm the effect appeared in the target process's log.
//!
//! There is no hidden global state: the station MAC counter and the active
//! checkpoint live in a `TestRun` context created once per run and passed to
//! the factories that need it.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::backend::{CommandRunner, ConsoleBackend};
use crate::config::{HarnessConfig, RemoteConfig};
use crate::console::{ConsoleLog, SharedConsole};
use crate::control::ControlChannel;
use crate::error::{BackendError, Result};
use crate::logwatch::{FileLog, LogWait};

/// Radio interfaces every entity exposes.
pub const RADIO_IFACES: [&str; 2] = ["wlan0", "wlan2"];

/// LAN bridge interface inside each device.
pub const BRIDGE_IFACE: &str = "br-lan";

static INET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet (?P<ip>[0-9.]+)").unwrap_or_else(|_| unreachable!())
});

static ETHER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"link/ether (?P<mac>([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2})")
        .unwrap_or_else(|_| unreachable!())
});

/// Role of an entity in the mesh, which also names its log and config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Agent,
}

impl Role {
    /// File-name component: `<prefix>_<role>.log`, `<prefix>_<role>.conf`.
    #[must_use]
    pub fn log_name(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.log_name())
    }
}

/// Filesystem conventions of a topology: where the stack is installed inside
/// each device and where the harness reads the per-entity log directories.
#[derive(Debug, Clone)]
pub struct TopologyPaths {
    /// Install prefix of the mesh stack inside each device.
    pub installdir: String,
    /// Host-side directory holding one log directory per container entity.
    pub log_dir: PathBuf,
    /// Log and config file name prefix.
    pub log_prefix: String,
    /// Treat nominal log files as pointer records naming the real file.
    pub pointer_records: bool,
    /// Poll interval for every file-backed log wait in this topology.
    pub poll_interval: Duration,
}

impl From<&HarnessConfig> for TopologyPaths {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            installdir: config.topology.installdir.clone(),
            log_dir: PathBuf::from(&config.topology.log_dir),
            log_prefix: config.topology.log_prefix.clone(),
            pointer_records: config.topology.pointer_records,
            poll_interval: Duration::from_millis(config.wait.poll_interval_ms),
        }
    }
}

/// Log source of an entity or radio: file-backed for containerized devices,
/// console-backed for devices reachable only over an interactive session.
pub enum LogSource {
    File(FileLog),
    Console(ConsoleLog),
}

impl LogSource {
    /// Wait for `pattern` after `start_line` within `timeout`. Same contract
    /// on both variants; assertions written against one backend hold on the
    /// other.
    pub async fn wait_for(&self, pattern: &Regex, start_line: usize, timeout: Duration) -> LogWait {
        match self {
            Self::File(log) => log.wait_for(pattern, start_line, timeout).await,
            Self::Console(log) => log.wait_for(pattern, start_line, timeout).await,
        }
    }
}

/// A logical mesh device: the controller or one agent.
pub struct Entity {
    name: String,
    mac: String,
    role: Role,
    installdir: String,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn ControlChannel>,
    log: LogSource,
    radios: Vec<Radio>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("role", &self.role)
            .field("installdir", &self.installdir)
            .finish_non_exhaustive()
    }
}

impl Entity {
    /// Attach to a containerized entity.
    ///
    /// Construction is fail-fast: the device config must parse, the device IP
    /// and control endpoint must answer, and both radios must be resolvable.
    /// Any failure aborts with no partial entity.
    pub async fn container(
        name: impl Into<String>,
        role: Role,
        paths: &TopologyPaths,
        runner: Arc<dyn CommandRunner>,
        control_factory: impl FnOnce(&str, u16) -> Arc<dyn ControlChannel>,
    ) -> Result<Self> {
        let name = name.into();
        let config_path = format!(
            "{}/config/{}_{}.conf",
            paths.installdir,
            paths.log_prefix,
            role.log_name()
        );
        let config_text = runner.run(&["cat", &config_path]).await?;
        let remote = RemoteConfig::parse(&config_path, &config_text)?;

        let ip = device_ip(runner.as_ref()).await?;
        let control = control_factory(&ip, remote.ucc_listener_port);
        let mac = control.dev_get_parameter("ALid").await?;

        // Container logs surface on the host through a per-entity mount.
        let log_dir = paths.log_dir.join(&name);
        let log = LogSource::File(
            FileLog::new(log_dir.join(format!("{}_{}.log", paths.log_prefix, role.log_name())))
                .with_pointer_record(paths.pointer_records)
                .with_poll_interval(paths.poll_interval),
        );

        let mut radios = Vec::with_capacity(RADIO_IFACES.len());
        for iface in RADIO_IFACES {
            let radio_log = LogSource::File(
                FileLog::new(log_dir.join(format!("{}_agent_{}.log", paths.log_prefix, iface)))
                    .with_pointer_record(paths.pointer_records)
                    .with_poll_interval(paths.poll_interval),
            );
            let event_file = format!("/tmp/$USER/{}/{iface}/EVENT", paths.log_prefix);
            radios
                .push(Radio::attach(iface, Arc::clone(&runner), radio_log, Some(event_file)).await?);
        }

        info!(entity = %name, role = %role, mac = %mac, ip = %ip, "entity attached");
        Ok(Self {
            name,
            mac,
            role,
            installdir: paths.installdir.clone(),
            runner,
            control,
            log,
            radios,
        })
    }

    /// Attach to an entity reachable only through its console.
    ///
    /// The console session carries both command execution and log tailing;
    /// `control_host` is the address the control endpoint listens on (the
    /// console transport knows nothing about IP reachability).
    pub async fn console(
        name: impl Into<String>,
        role: Role,
        paths: &TopologyPaths,
        session: SharedConsole,
        control_host: &str,
        control_factory: impl FnOnce(&str, u16) -> Arc<dyn ControlChannel>,
    ) -> Result<Self> {
        let name = name.into();
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ConsoleBackend::new(Arc::clone(&session)));

        let config_path = format!(
            "{}/config/{}_{}.conf",
            paths.installdir,
            paths.log_prefix,
            role.log_name()
        );
        let config_text = runner.run(&["cat", &config_path]).await?;
        let remote = RemoteConfig::parse(&config_path, &config_text)?;

        let control = control_factory(control_host, remote.ucc_listener_port);
        let mac = control.dev_get_parameter("ALid").await?;

        // The device names its own log folder; files are read remotely.
        let log = LogSource::Console(ConsoleLog::new(
            Arc::clone(&session),
            format!(
                "{}/{}_{}.log",
                remote.log_folder,
                paths.log_prefix,
                role.log_name()
            ),
        ));

        let mut radios = Vec::with_capacity(RADIO_IFACES.len());
        for iface in RADIO_IFACES {
            let radio_log = LogSource::Console(ConsoleLog::new(
                Arc::clone(&session),
                format!("{}/{}_agent_{iface}.log", remote.log_folder, paths.log_prefix),
            ));
            radios.push(Radio::attach(iface, Arc::clone(&runner), radio_log, None).await?);
        }

        info!(entity = %name, role = %role, mac = %mac, "console entity attached");
        Ok(Self {
            name,
            mac,
            role,
            installdir: paths.installdir.clone(),
            runner,
            control,
            log,
            radios,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// AL hardware address identifying this device in the mesh.
    #[must_use]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn radios(&self) -> &[Radio] {
        &self.radios
    }

    /// Radio by interface name.
    #[must_use]
    pub fn radio(&self, iface: &str) -> Option<&Radio> {
        self.radios.iter().find(|r| r.iface() == iface)
    }

    /// Run a command on the device through its backend.
    pub async fn command(&self, argv: &[&str]) -> Result<String> {
        self.runner.run(argv).await
    }

    /// Run an installdir-relative program on the device.
    pub async fn installdir_command(&self, relative: &str, args: &[&str]) -> Result<String> {
        let program = format!("{}/{relative}", self.installdir);
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program.as_str());
        argv.extend_from_slice(args);
        self.runner.run(&argv).await
    }

    /// Wait for `pattern` in this entity's own process log.
    pub async fn wait_for_log(
        &self,
        pattern: &Regex,
        start_line: usize,
        timeout: Duration,
    ) -> LogWait {
        debug!(entity = %self.name, pattern = pattern.as_str(), start_line, "entity log wait");
        self.log.wait_for(pattern, start_line, timeout).await
    }

    /// Query a device parameter over the control channel.
    pub async fn dev_get_parameter(&self, name: &str) -> Result<String> {
        self.control.dev_get_parameter(name).await
    }

    /// Raw control command, returning the completion payload.
    pub async fn cmd_reply(&self, command: &str) -> Result<String> {
        self.control.cmd_reply(command).await
    }

    /// Ask this device to send a 1905.1 message.
    pub async fn dev_send_1905(
        &self,
        dest_mac: &str,
        message_type: u16,
        tlvs: &str,
    ) -> Result<String> {
        self.control.dev_send_1905(dest_mac, message_type, tlvs).await
    }

    /// Start WPS registration on the given band.
    pub async fn start_wps_registration(&self, band: &str) -> Result<String> {
        self.control.start_wps_registration(band).await
    }
}

/// One physical radio of an entity.
pub struct Radio {
    iface: String,
    mac: String,
    log: LogSource,
    vaps: Vec<VirtualAP>,
}

impl Radio {
    /// Resolve the radio's MAC over the backend and create its initial VAP.
    ///
    /// The first virtual AP shares the radio's MAC as its BSSID; more can be
    /// discovered later by tests that reconfigure the device.
    async fn attach(
        iface: &str,
        runner: Arc<dyn CommandRunner>,
        log: LogSource,
        event_file: Option<String>,
    ) -> Result<Self> {
        let output = runner.run(&["ip", "link", "show", iface]).await?;
        let mac = capture(&ETHER_RE, "mac", &output).ok_or_else(|| {
            BackendError::ParseError(format!("no MAC for {iface} in {output:?}"))
        })?;

        let vaps = vec![VirtualAP {
            bssid: mac.clone(),
            iface: iface.to_string(),
            runner,
            event_file,
        }];

        Ok(Self {
            iface: iface.to_string(),
            mac,
            log,
            vaps,
        })
    }

    #[must_use]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    #[must_use]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    #[must_use]
    pub fn vaps(&self) -> &[VirtualAP] {
        &self.vaps
    }

    /// Wait for `pattern` in this radio's per-interface log.
    pub async fn wait_for_log(
        &self,
        pattern: &Regex,
        start_line: usize,
        timeout: Duration,
    ) -> LogWait {
        debug!(iface = %self.iface, pattern = pattern.as_str(), start_line, "radio log wait");
        self.log.wait_for(pattern, start_line, timeout).await
    }
}

/// A virtual access point hosted on a radio.
pub struct VirtualAP {
    bssid: String,
    iface: String,
    runner: Arc<dyn CommandRunner>,
    /// Event pipe the agent process reads association events from; only
    /// containerized backends expose one.
    event_file: Option<String>,
}

impl VirtualAP {
    #[must_use]
    pub fn bssid(&self) -> &str {
        &self.bssid
    }

    #[must_use]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Simulate `station` associating to this AP.
    pub async fn associate(&self, station: &Station) -> Result<()> {
        self.send_event(&format!("EVENT AP-STA-CONNECTED {}", station.mac()))
            .await
    }

    /// Simulate `station` disassociating from this AP.
    pub async fn disassociate(&self, station: &Station) -> Result<()> {
        self.send_event(&format!("EVENT AP-STA-DISCONNECTED {}", station.mac()))
            .await
    }

    async fn send_event(&self, event: &str) -> Result<()> {
        let Some(file) = &self.event_file else {
            return Err(BackendError::Unsupported("station events over console").into());
        };
        debug!(iface = %self.iface, event, "injecting station event");
        let command = format!("echo \"{event}\" > {file}");
        self.runner.run(&["sh", "-c", &command]).await?;
        Ok(())
    }
}

/// A simulated wireless client. Stations are plain values with no teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    mac: String,
}

impl Station {
    #[must_use]
    pub fn mac(&self) -> &str {
        &self.mac
    }
}

/// Hook reset whenever a checkpoint is taken. Consumers that correlate
/// against log content authored before the checkpoint (packet captures and
/// the like) register here.
pub trait CheckpointObserver: Send + Sync {
    fn reset(&self);
}

/// Per-run context: the station MAC counter and the active checkpoint.
/// Created once per test run and passed to whatever needs it.
#[derive(Default)]
pub struct TestRun {
    station_counter: AtomicU32,
    checkpoint: AtomicU32,
    observers: Mutex<Vec<Arc<dyn CheckpointObserver>>>,
}

impl TestRun {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a station with a MAC unique within this run.
    ///
    /// MACs follow `51:a1:10:20:xx:xx`; the 16-bit suffix wraps after 65536
    /// stations, so uniqueness holds for any realistic test case.
    pub fn station(&self) -> Station {
        let index = self.station_counter.fetch_add(1, Ordering::Relaxed) % 65536;
        Station {
            mac: format!("51:a1:10:20:{:02x}:{:02x}", index >> 8, index & 0xff),
        }
    }

    /// Take a new checkpoint, resetting every registered observer. Returns
    /// the checkpoint's sequence number.
    pub fn checkpoint(&self) -> u32 {
        let seq = self.checkpoint.fetch_add(1, Ordering::Relaxed) + 1;
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for observer in observers.iter() {
            observer.reset();
        }
        info!(checkpoint = seq, observers = observers.len(), "checkpoint taken");
        seq
    }

    /// Register an observer to be reset on every checkpoint.
    pub fn register_observer(&self, observer: Arc<dyn CheckpointObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }
}

/// The attached topology: one controller, the agents, and the run context.
pub struct Topology {
    controller: Entity,
    agents: Vec<Entity>,
    run: Arc<TestRun>,
}

impl Topology {
    #[must_use]
    pub fn new(controller: Entity, agents: Vec<Entity>, run: Arc<TestRun>) -> Self {
        Self {
            controller,
            agents,
            run,
        }
    }

    #[must_use]
    pub fn controller(&self) -> &Entity {
        &self.controller
    }

    #[must_use]
    pub fn agents(&self) -> &[Entity] {
        &self.agents
    }

    /// Agent by entity name.
    #[must_use]
    pub fn agent(&self, name: &str) -> Option<&Entity> {
        self.agents.iter().find(|a| a.name() == name)
    }

    #[must_use]
    pub fn run(&self) -> &Arc<TestRun> {
        &self.run
    }
}

/// IP of the device's LAN bridge, queried over the backend.
async fn device_ip(runner: &dyn CommandRunner) -> Result<String> {
    let output = runner
        .run(&["ip", "-f", "inet", "addr", "show", BRIDGE_IFACE])
        .await?;
    capture(&INET_RE, "ip", &output).ok_or_else(|| {
        BackendError::ParseError(format!("no inet address for {BRIDGE_IFACE} in {output:?}")).into()
    })
}

/// First named capture of `pattern` in `text`.
fn capture(pattern: &Regex, group: &str, text: &str) -> Option<String> {
    pattern
        .captures(text)?
        .name(group)
        .map(|m| m.as_str().to_string())
}
