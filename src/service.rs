//! Port mapping client and service.
//!
//! The long-running half of the crate: a [`Client`] hands a local port to a
//! spawned [`Service`] which discovers the gateways around it, obtains a
//! mapping from the best one, keeps it renewed at half-lifetime, re-maps it
//! when it expires and releases it when the port is deactivated. The most
//! recent external address is published through a watch channel.

use std::{
    net::SocketAddr,
    num::NonZeroU16,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use futures::{FutureExt, StreamExt};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot, watch,
};
use tracing::{debug, info_span, trace, Instrument};

use crate::{
    current_mapping::{self, CurrentMapping},
    defaults, discovery,
    gateway::NetworkGateway,
    mapping::{MappedPort, Mapper, PortType, ProtocolTag},
    util,
};

/// How long a gateway found by a probe keeps being trusted without
/// re-running discovery.
const GATEWAY_TRUST_WINDOW: Duration = Duration::from_secs(10 * 60);

/// After discovery came up empty, mapping attempts wait this long before
/// triggering it again.
const EMPTY_PROBE_BACKOFF: Duration = Duration::from_secs(5);

/// Command queue between the client handles and the service task.
const MESSAGE_CHANNEL_CAPACITY: usize = 32;

/// Answer handed to probe waiters.
type ProbeResult = Result<ProbeOutput, String>;

/// Which protocols a probe found usable gateways for.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("probe {{ pcp: {pcp}, nat-pmp: {pmp}, upnp: {upnp} }}")]
pub struct ProbeOutput {
    /// A UPnP-IGD service answered recently.
    pub upnp: bool,
    /// A PCP gateway answered recently.
    pub pcp: bool,
    /// A NAT-PMP gateway answered recently.
    pub pmp: bool,
}

impl ProbeOutput {
    /// True when every protocol already has a known gateway.
    pub fn all_available(&self) -> bool {
        self.upnp && self.pcp && self.pmp
    }
}

#[derive(derive_more::Debug)]
enum Message {
    /// Get a mapping going for the configured port if none is active.
    ProcureMapping,
    /// Change the port mappings are kept for, or clear it with `None`.
    UpdateLocalPort { local_port: Option<NonZeroU16> },
    /// Find out which protocols have a usable gateway.
    Probe {
        /// Where the requester waits for the answer.
        #[debug("_")]
        result_tx: oneshot::Sender<ProbeResult>,
    },
}

/// Selects which protocols the [`Service`] may use.
#[derive(Debug, Clone)]
pub struct Config {
    /// Allow mappings through UPnP-IGD services.
    pub enable_upnp: bool,
    /// Allow mappings through PCP gateways.
    pub enable_pcp: bool,
    /// Allow mappings through NAT-PMP gateways.
    pub enable_nat_pmp: bool,
}

impl Default for Config {
    /// Every protocol is fair game.
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_pcp: true,
            enable_nat_pmp: true,
        }
    }
}

/// Handle to the port mapping service.
///
/// Clones share one service task; the task is aborted together with the
/// last handle.
#[derive(Debug, Clone)]
pub struct Client {
    /// Sees the external address whenever the active mapping changes.
    external_addr: watch::Receiver<Option<SocketAddr>>,
    /// Commands to the service task.
    service_tx: mpsc::Sender<Message>,
    /// Ties the service task's lifetime to the handles.
    _service_handle: Arc<util::CancelOnDrop>,
}

impl Client {
    /// Starts the service with every protocol enabled.
    ///
    /// See [`Config::default`].
    pub fn default() -> Self {
        Self::new(Config::default())
    }

    /// Starts the port mapping service and returns a handle to it.
    pub fn new(config: Config) -> Self {
        let (service_tx, service_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (service, external_addr) = Service::new(config, service_rx);
        let task = tokio::spawn(
            async move { service.run().await }.instrument(info_span!("portmapper.service")),
        );
        Client {
            external_addr,
            service_tx,
            _service_handle: Arc::new(util::CancelOnDrop::new(
                "portmapper service",
                task.abort_handle(),
            )),
        }
    }

    /// Triggers a probe of the port mapping protocols.
    ///
    /// The answer arrives on the returned channel. Requests made while a
    /// probe is running are coalesced onto that run.
    pub fn probe(&self) -> oneshot::Receiver<Result<ProbeOutput, String>> {
        let (result_tx, result_rx) = oneshot::channel();
        if let Err(e) = self.service_tx.try_send(Message::Probe { result_tx }) {
            let failure = match &e {
                TrySendError::Full(_) => "port mapping service is busy",
                TrySendError::Closed(_) => "port mapping service is gone",
            };
            let Message::Probe { result_tx } = e.into_inner() else {
                unreachable!("a probe was sent");
            };
            // the requester may have stopped listening, in which case there
            // is nobody to tell
            let _ = result_tx.send(Err(failure.into()));
        }
        result_rx
    }

    /// Attempts a mapping for the configured port if none is active.
    pub fn procure_mapping(&self) {
        self.send(Message::ProcureMapping);
    }

    /// Sets the local port mappings are maintained for.
    ///
    /// A change releases the old mapping and starts an attempt for the new
    /// port.
    pub fn update_local_port(&self, local_port: NonZeroU16) {
        self.send(Message::UpdateLocalPort {
            local_port: Some(local_port),
        });
    }

    /// Releases the active mapping and stops maintaining one.
    pub fn deactivate(&self) {
        self.send(Message::UpdateLocalPort { local_port: None });
    }

    /// Watches the external address of the active mapping.
    pub fn watch_external_address(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.external_addr.clone()
    }

    fn send(&self, message: Message) {
        // the service winding down is the only failure here and it is not
        // actionable for the caller
        if let Err(e) = self.service_tx.try_send(message) {
            debug!("port mapping service did not take the command: {e}");
        }
    }
}

/// Mappers discovered during a probe, and when they were last seen.
#[derive(Debug, Default)]
struct Probe {
    /// When was the probe last updated.
    last_probe: Option<Instant>,
    /// The last UPnP mapper and when it was last seen.
    last_upnp: Option<(Mapper, Instant)>,
    /// The last PCP mapper and when it was last seen.
    last_pcp: Option<(Mapper, Instant)>,
    /// The last NAT-PMP mapper and when it was last seen.
    last_pmp: Option<(Mapper, Instant)>,
}

impl Probe {
    /// Merges freshly discovered mappers in.
    fn update(&mut self, mappers: Vec<Mapper>) {
        let now = Instant::now();
        for mapper in mappers {
            let slot = match mapper.protocol() {
                ProtocolTag::Pcp => &mut self.last_pcp,
                ProtocolTag::NatPmp => &mut self.last_pmp,
                ProtocolTag::UpnpPortMapping => &mut self.last_upnp,
                // firewall pinholes are not used for the v4 mapping the
                // service maintains
                ProtocolTag::UpnpFirewall => continue,
            };
            *slot = Some((mapper, now));
        }
        self.last_probe = Some(now);
    }

    /// Which protocols are still within their trust window.
    fn output(&self) -> ProbeOutput {
        let now = Instant::now();
        let fresh = |slot: &Option<(Mapper, Instant)>| {
            slot.as_ref()
                .map(|(_, last_seen)| *last_seen + GATEWAY_TRUST_WINDOW > now)
                .unwrap_or_default()
        };
        ProbeOutput {
            upnp: fresh(&self.last_upnp),
            pcp: fresh(&self.last_pcp),
            pmp: fresh(&self.last_pmp),
        }
    }

    /// The best still-trusted mapper: PCP first, NAT-PMP second, and UPnP
    /// last, it being the flakiest of the three.
    fn best(&self, config: &Config) -> Option<Mapper> {
        let output = self.output();
        if config.enable_pcp && output.pcp {
            return self.last_pcp.as_ref().map(|(mapper, _)| mapper.clone());
        }
        if config.enable_nat_pmp && output.pmp {
            return self.last_pmp.as_ref().map(|(mapper, _)| mapper.clone());
        }
        if config.enable_upnp && output.upnp {
            return self.last_upnp.as_ref().map(|(mapper, _)| mapper.clone());
        }
        None
    }

    fn recently_probed(&self) -> bool {
        self.last_probe
            .map(|last| last + EMPTY_PROBE_BACKOFF > Instant::now())
            .unwrap_or_default()
    }
}

/// Picks the mappers the configuration allows.
fn allowed(config: &Config, mappers: Vec<Mapper>) -> Vec<Mapper> {
    mappers
        .into_iter()
        .filter(|mapper| match mapper.protocol() {
            ProtocolTag::Pcp => config.enable_pcp,
            ProtocolTag::NatPmp => config.enable_nat_pmp,
            ProtocolTag::UpnpPortMapping | ProtocolTag::UpnpFirewall => config.enable_upnp,
        })
        .collect()
}

/// A port mapping service.
#[derive(derive_more::Debug)]
pub struct Service {
    config: Config,
    /// Multiplexer all socket traffic goes through.
    net: NetworkGateway,
    /// Port mappings are procured for this local port.
    local_port: Option<NonZeroU16>,
    /// Commands from the client handles. The service winds down once every
    /// handle is gone.
    rx: mpsc::Receiver<Message>,
    /// The mapping being maintained, with its renew and expire timers.
    current_mapping: CurrentMapping,
    /// Driver that created the active mapping; renewals and releases go
    /// back through it.
    current_mapper: Option<Mapper>,
    /// What past probes found and when.
    full_probe: Probe,
    /// In-progress attempt to obtain or renew a mapping. Replaced, aborting
    /// the old attempt, whenever the target port changes.
    #[debug("_")]
    mapping_task: Option<util::AbortingJoinHandle<Result<(Mapper, MappedPort)>>>,
    /// In-progress discovery run plus everyone waiting on its result.
    #[debug("_")]
    probing_task: Option<(
        util::AbortingJoinHandle<Result<Vec<Mapper>, String>>,
        Vec<oneshot::Sender<ProbeResult>>,
    )>,
}

impl Service {
    fn new(
        config: Config,
        rx: mpsc::Receiver<Message>,
    ) -> (Self, watch::Receiver<Option<SocketAddr>>) {
        let (current_mapping, watcher) = CurrentMapping::new();
        let service = Service {
            config,
            net: NetworkGateway::spawn(),
            local_port: None,
            rx,
            current_mapping,
            current_mapper: None,
            full_probe: Probe::default(),
            mapping_task: None,
            probing_task: None,
        };

        (service, watcher)
    }

    /// Clears the current mapping and releases it as best effort.
    async fn invalidate_mapping(&mut self) {
        if let Some(old_mapping) = self.current_mapping.update(None) {
            if let Some(mapper) = self.current_mapper.take() {
                tokio::spawn(
                    async move {
                        if let Err(e) = mapper.unmap_port(&old_mapping).await {
                            debug!("failed to release mapping: {e}");
                        }
                    }
                    .instrument(info_span!("portmapper.unmap")),
                );
            }
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!("portmap service started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("no clients left, stopping");
                        break;
                    };
                    trace!("command: {command:?}");
                    self.handle_msg(command).await;
                }
                outcome = util::MaybeFuture { inner: self.mapping_task.as_mut() } => {
                    trace!("mapping attempt finished");
                    self.mapping_task = None;
                    // a join error means the attempt panicked or was
                    // aborted, fold it into the mapping outcome
                    let outcome = outcome
                        .unwrap_or_else(|e| Err(anyhow!("mapping task failed: {e}")));
                    self.on_mapping_result(outcome);
                }
                outcome = util::MaybeFuture { inner: self.probing_task.as_mut().map(|(task, _)| task) } => {
                    trace!("probe finished");
                    let (_, waiters) = self.probing_task.take().expect("task just completed");
                    let outcome = outcome
                        .unwrap_or_else(|e| Err(format!("probe task failed: {e}")));
                    self.on_probe_result(outcome, waiters);
                }
                Some(event) = self.current_mapping.next() => {
                    trace!("lifetime event: {event:?}");
                    match event {
                        current_mapping::Event::Renew { mapping } => self.renew_mapping(mapping),
                        current_mapping::Event::Expired { .. } => {
                            // the gateway already dropped it, map from scratch
                            self.current_mapper = None;
                            self.get_mapping();
                        },
                    }
                }
            }
        }
        self.net.kill();
        Ok(())
    }

    fn on_probe_result(
        &mut self,
        result: Result<Vec<Mapper>, String>,
        waiters: Vec<oneshot::Sender<ProbeResult>>,
    ) {
        let output = result.map(|mappers| {
            self.full_probe.update(mappers);
            let output = self.full_probe.output();
            debug!("probe finished: {output}");
            output
        });
        for waiter in waiters {
            // a waiter that stopped listening is fine
            let _ = waiter.send(output.clone());
        }
    }

    fn on_mapping_result(&mut self, result: Result<(Mapper, MappedPort)>) {
        match result {
            Ok((mapper, mapping)) => {
                // remember the discovered mapper for later attempts as well
                self.full_probe.update(vec![mapper.clone()]);
                self.current_mapper = Some(mapper);
                self.current_mapping.update(Some(mapping));
            }
            Err(e) => {
                debug!("failed to get a port mapping {e}");
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::ProcureMapping => self.update_local_port(self.local_port).await,
            Message::UpdateLocalPort { local_port } => self.update_local_port(local_port).await,
            Message::Probe { result_tx } => self.probe_request(result_tx),
        }
    }

    /// Points the service at a new local port.
    ///
    /// A change cancels whatever mapping work is in progress, releases the
    /// mapping tied to the old port and starts over for the new one. `None`
    /// turns port mapping off.
    async fn update_local_port(&mut self, local_port: Option<NonZeroU16>) {
        if local_port == self.local_port {
            // same port: just make sure a mapping exists
            if self.current_mapping.external().is_none() {
                self.get_mapping();
            }
            return;
        }
        let previous = std::mem::replace(&mut self.local_port, local_port);

        if let Some(task) = self.mapping_task.take() {
            if !task.is_finished() {
                debug!(
                    "local port {previous:?} -> {:?}, dropping the running mapping attempt",
                    self.local_port
                );
            }
        }

        // the old mapping forwards to the wrong port now
        if self.current_mapping.external().is_some() {
            self.invalidate_mapping().await;
        }

        self.get_mapping();
    }

    /// Refreshes the active mapping through the mapper that created it.
    fn renew_mapping(&mut self, mapping: MappedPort) {
        let Some(mapper) = self.current_mapper.clone() else {
            return self.get_mapping();
        };
        if self.mapping_task.is_some() {
            return;
        }
        debug!("renewing {mapping}");
        let task = async move {
            let renewed = mapper
                .refresh_port(&mapping, defaults::RECOMMENDED_MAPPING_LIFETIME)
                .await?;
            Ok((mapper, renewed))
        };
        self.mapping_task =
            Some(tokio::spawn(task.instrument(info_span!("portmapper.refresh"))).into());
    }

    fn get_mapping(&mut self) {
        let Some(local_port) = self.local_port else {
            return;
        };
        debug!("getting a port mapping for local port {local_port}");

        let config = self.config.clone();
        let net = self.net.clone();
        let task = match self.full_probe.best(&config) {
            Some(mapper) => async move {
                let mapping = mapper
                    .map_port(
                        PortType::Udp,
                        local_port,
                        None,
                        defaults::RECOMMENDED_MAPPING_LIFETIME,
                    )
                    .await?;
                Ok((mapper, mapping))
            }
            .boxed(),
            None => {
                if self.full_probe.recently_probed() {
                    debug!("no service available for a mapping");
                    return;
                }
                // no trusted service: discover first, then map over the best
                // mapper found
                async move {
                    let mappers = allowed(&config, discovery::discover(&net).await?);
                    let mut last_error = None;
                    for mapper in prioritized(mappers) {
                        match mapper
                            .map_port(
                                PortType::Udp,
                                local_port,
                                None,
                                defaults::RECOMMENDED_MAPPING_LIFETIME,
                            )
                            .await
                        {
                            Ok(mapping) => return Ok((mapper, mapping)),
                            Err(e) => {
                                debug!("mapping through {mapper} failed: {e}");
                                last_error = Some(e);
                            }
                        }
                    }
                    Err(last_error
                        .map(Into::into)
                        .unwrap_or_else(|| anyhow!("no mapper could be used")))
                }
                .boxed()
            }
        };
        self.mapping_task =
            Some(tokio::spawn(task.instrument(info_span!("portmapper.map"))).into());
    }

    /// Answers a probe request.
    ///
    /// Joins the in-progress probe if one is running. A cached result that
    /// is still trusted on every protocol is answered directly; anything
    /// else kicks off discovery.
    fn probe_request(&mut self, result_tx: oneshot::Sender<ProbeResult>) {
        if let Some((_, waiters)) = self.probing_task.as_mut() {
            waiters.push(result_tx);
            return;
        }
        let cached = self.full_probe.output();
        if cached.all_available() {
            let _ = result_tx.send(Ok(cached));
            return;
        }
        let net = self.net.clone();
        let config = self.config.clone();
        let task = tokio::spawn(
            async move {
                discovery::discover(&net)
                    .await
                    .map(|mappers| allowed(&config, mappers))
                    .map_err(|e| e.to_string())
            }
            .instrument(info_span!("portmapper.probe")),
        );
        self.probing_task = Some((task.into(), vec![result_tx]));
    }
}

/// Orders mappers by preference: PCP first, then NAT-PMP, then UPnP.
fn prioritized(mut mappers: Vec<Mapper>) -> Vec<Mapper> {
    let rank = |mapper: &Mapper| match mapper.protocol() {
        ProtocolTag::Pcp => 0,
        ProtocolTag::NatPmp => 1,
        ProtocolTag::UpnpPortMapping => 2,
        ProtocolTag::UpnpFirewall => 3,
    };
    mappers.sort_by_key(rank);
    mappers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prioritized_prefers_pcp() {
        // mapper construction needs a running runtime for the gateway actor
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let net = NetworkGateway::spawn();
        let local = "192.168.1.2".parse().unwrap();
        let gateway = "192.168.1.1".parse().unwrap();
        let mappers = vec![
            Mapper::NatPmp(crate::nat_pmp::NatPmpMapper::new(
                net.clone(),
                local,
                gateway,
            )),
            Mapper::Pcp(crate::pcp::PcpMapper::new(
                net.clone(),
                std::net::IpAddr::V4(local),
                std::net::IpAddr::V4(gateway),
            )),
        ];
        let ordered = prioritized(mappers);
        assert_eq!(ordered[0].protocol(), ProtocolTag::Pcp);
        assert_eq!(ordered[1].protocol(), ProtocolTag::NatPmp);
    }

    #[tokio::test]
    async fn test_probe_output_expires() {
        let mut probe = Probe::default();
        let net = NetworkGateway::spawn();
        let mapper = Mapper::Pcp(crate::pcp::PcpMapper::new(
            net,
            "192.168.1.2".parse().unwrap(),
            "192.168.1.1".parse().unwrap(),
        ));
        probe.update(vec![mapper]);
        assert!(probe.output().pcp);
        assert!(!probe.output().upnp);
        assert!(probe.best(&Config::default()).is_some());

        let upnp_only = Config {
            enable_pcp: false,
            enable_nat_pmp: false,
            enable_upnp: true,
        };
        assert!(probe.best(&upnp_only).is_none());
    }
}
