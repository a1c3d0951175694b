//! Pipeline runtime
//!
//! Builds the arena of routers and producers from a parsed configuration,
//! spawns one task per component, and owns the lifecycle: Start
//! broadcast, startup marker, signal handling, and the staged shutdown
//! sequence (consumers drain first, then producers, then a hard
//! deadline).
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use once_cell::sync::Lazy;

use crate::config::{Config, ExecutionType, ParsedComponent, ParsedConfig, ParsedModulator};
use crate::consumer::{run_consumer, ConsumerContext};
use crate::control::{health, ControlHub, ControlSignal, Fuse, HealthRegistry};
use crate::modules::register_plugins;
use crate::modules::routers::broadcast::Broadcast;
use crate::modulator::{Modulator, ModulatorChain};
use crate::producer::{run_producer, PluginState, ProducerContext, ProducerHandle, RateGate, StateCell};
use crate::router::{Dispatcher, RouterUnit};
use crate::stream::{StreamId, StreamNames, WILDCARD_STREAM};
use crate::telemetry::Telemetry;
use crate::Error;

static REGISTER: Once = Once::new();
/// Stores any error that occurred during plugin registration
static REGISTER_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// How long the runtime waits for every component to reach Active before
/// reporting startup anyway.
const STARTUP_WAIT: Duration = Duration::from_secs(2);

/// Represents a single configured pipeline ready to run
pub struct Runtime {
    config: ParsedConfig,
    timeout: Option<Duration>,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    telemetry: Telemetry,
}

struct ProducerSpec {
    component: ParsedComponent,
    handle: ProducerHandle,
    receiver: flume::Receiver<crate::Message>,
    fuse: Arc<Fuse>,
    state: Arc<StateCell>,
    streams: Vec<StreamId>,
    fallback: Option<StreamId>,
}

impl Runtime {
    /// Registers the built-in plugins, parses and validates the
    /// configuration, and returns a runnable pipeline.
    /// ```
    /// use weir::Runtime;
    ///
    /// let conf_str = r#"consumers:
    ///  - stream: app
    ///    generator:
    ///      count: 1
    ///producers:
    ///  - stream: app
    ///    drop: {}"#;
    /// # tokio_test::block_on(async {
    /// let pipeline = Runtime::from_config(conf_str).await.unwrap();
    /// # })
    /// ```
    pub async fn from_config(config: &str) -> Result<Self, Error> {
        REGISTER.call_once(|| {
            if let Err(e) = register_plugins() {
                if let Ok(mut err) = REGISTER_ERROR.lock() {
                    *err = Some(format!("{e}"));
                }
            }
        });

        if let Ok(err_lock) = REGISTER_ERROR.lock() {
            if let Some(ref e) = *err_lock {
                return Err(Error::ExecutionError(format!(
                    "Plugin registration failed: {e}"
                )));
            }
        }
        trace!("plugins registered");

        let conf: Config = Config::from_str(config)?;
        let parsed_conf = conf.validate().await?;

        debug!("Runtime is ready");
        Ok(Runtime {
            config: parsed_conf,
            timeout: None,
            ready: Mutex::new(None),
            telemetry: Telemetry::new(),
        })
    }

    /// Replaces the pipeline label.
    pub fn set_label(&mut self, label: Option<String>) {
        self.config.label = label;
    }

    /// Current pipeline label.
    pub fn get_label(&self) -> Option<String> {
        self.config.label.clone()
    }

    /// Limits how long the pipeline runs before a graceful shutdown.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Overrides the address serving the health-check registry.
    pub fn set_health_addr(&mut self, addr: Option<String>) {
        self.config.health_addr = addr;
    }

    /// The telemetry registry the pipeline records into.
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.clone()
    }

    /// Returns a channel that fires once every component reached Active.
    /// Used for the CLI's startup marker.
    pub fn on_ready(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut ready) = self.ready.lock() {
            *ready = Some(tx);
        }
        rx
    }

    /// Runs the pipeline until every consumer reaches end of input or a
    /// shutdown signal arrives, then drains through the staged shutdown
    /// sequence.
    pub async fn run(&self) -> Result<(), Error> {
        let names = Arc::new(StreamNames::new());
        let hub = ControlHub::new();
        let health_registry = HealthRegistry::new();
        let mut all_states: Vec<Arc<StateCell>> = Vec::new();

        // producers first: their handles are what routers attach to
        let mut producer_specs = Vec::new();
        for component in &self.config.producers {
            let fuse = Fuse::new();
            let state = StateCell::new();
            let (tx, rx) = flume::bounded(component.channel);
            let fallback = component.fallback.as_deref().map(|name| names.intern(name));
            let streams: Vec<StreamId> =
                component.streams.iter().map(|s| names.intern(s)).collect();
            let handle = ProducerHandle::new(
                Arc::from(component.label.as_str()),
                tx,
                component.timeout,
                fallback,
                Arc::clone(&fuse),
                Arc::clone(&state),
                self.telemetry.clone(),
            );

            let check_state = Arc::clone(&state);
            health_registry.register(
                format!("/producer/{}/alive", component.label),
                Arc::new(move || match check_state.get() {
                    PluginState::Dead => (503, "dead\n".to_string()),
                    _ => (200, "alive\n".to_string()),
                }),
            );

            all_states.push(Arc::clone(&state));
            producer_specs.push(ProducerSpec {
                component: component.clone(),
                handle,
                receiver: rx,
                fuse,
                state,
                streams,
                fallback,
            });
        }

        // routers: explicit entries first, then implicit broadcast routers
        // for every stream only referenced by consumers or producers
        let mut routers: Vec<RouterUnit> = Vec::new();
        for component in &self.config.routers {
            let stream_name = match component.streams.first() {
                Some(name) => name.clone(),
                None => continue,
            };
            let stream = names.intern(&stream_name);
            let policy = match construct(&component.item).await {
                Ok(ExecutionType::Router(p)) => p,
                Ok(_) => {
                    error!(label = component.label, "invalid execution type for router");
                    continue;
                }
                Err(e) => {
                    error!(
                        label = component.label,
                        error = format!("{e}"),
                        "router construction failed, entry skipped"
                    );
                    continue;
                }
            };
            let chain = match build_chain(&component.modulators).await {
                Ok(chain) => chain,
                Err(e) => {
                    error!(
                        label = component.label,
                        error = format!("{e}"),
                        "router modulators failed, entry skipped"
                    );
                    continue;
                }
            };
            if routers.iter().any(|r| r.stream == stream) {
                warn!(
                    label = component.label,
                    stream = stream_name,
                    "stream already has a router, entry ignored"
                );
                continue;
            }
            routers.push(RouterUnit {
                stream,
                label: component.label.clone(),
                chain,
                policy,
                producers: attached_producers(&producer_specs, stream),
                fallback: component.fallback.as_deref().map(|name| names.intern(name)),
            });
        }

        let mut referenced: Vec<StreamId> = Vec::new();
        for component in self.config.consumers.iter().chain(&self.config.producers) {
            for name in &component.streams {
                if name == WILDCARD_STREAM {
                    continue;
                }
                let id = names.intern(name);
                if !referenced.contains(&id) {
                    referenced.push(id);
                }
            }
            if let Some(name) = &component.fallback {
                let id = names.intern(name);
                if !referenced.contains(&id) {
                    referenced.push(id);
                }
            }
        }
        for stream in referenced {
            if routers.iter().any(|r| r.stream == stream) {
                continue;
            }
            routers.push(RouterUnit {
                stream,
                label: names.name_of(stream).unwrap_or_default(),
                chain: ModulatorChain::empty(),
                policy: Box::new(Broadcast),
                producers: attached_producers(&producer_specs, stream),
                fallback: None,
            });
        }

        // the wildcard fallback router gives misrouted messages a home
        let wildcard = StreamId::wildcard();
        let fallback_index = routers.len();
        routers.push(RouterUnit {
            stream: wildcard,
            label: "wildcard".to_string(),
            chain: ModulatorChain::empty(),
            policy: Box::new(Broadcast),
            producers: wildcard_producers(&producer_specs),
            fallback: None,
        });

        let net = Arc::new(Dispatcher::new(
            routers,
            fallback_index,
            Arc::clone(&names),
            self.telemetry.clone(),
        ));

        // spawn producer loops; sharded producers run one loop per
        // instance over a shared channel
        let mut producers_set: JoinSet<Result<(), Error>> = JoinSet::new();
        let mut started_producers = 0;
        for spec in producer_specs {
            let chain = Arc::new(build_chain(&spec.component.modulators).await?);
            let mut instantiated = 0;
            for _ in 0..spec.component.instances {
                let plugin = match construct(&spec.component.item).await {
                    Ok(ExecutionType::Producer(p)) => p,
                    Ok(_) => {
                        error!(
                            label = spec.component.label,
                            "invalid execution type for producer"
                        );
                        break;
                    }
                    Err(e) => {
                        error!(
                            label = spec.component.label,
                            error = format!("{e}"),
                            "producer construction failed, entry skipped"
                        );
                        break;
                    }
                };
                let ctx = ProducerContext {
                    label: Arc::from(spec.component.label.as_str()),
                    state: Arc::clone(&spec.state),
                    fuse: Arc::clone(&spec.fuse),
                    chain: Arc::clone(&chain),
                    fallback: spec.fallback,
                    net: Arc::clone(&net),
                    telemetry: self.telemetry.clone(),
                    write_errors: Arc::new(RateGate::default()),
                };
                let control = hub.register_producer();
                let receiver = spec.receiver.clone();
                let _ = producers_set.spawn(run_producer(plugin, receiver, control, ctx));
                instantiated += 1;
            }
            if instantiated > 0 {
                started_producers += 1;
            }
        }
        if started_producers == 0 {
            return Err(Error::Validation("no producer could be constructed".into()));
        }

        // spawn consumer loops
        let mut consumers_set: JoinSet<Result<(), Error>> = JoinSet::new();
        let mut started_consumers = 0;
        for component in &self.config.consumers {
            let plugin = match construct(&component.item).await {
                Ok(ExecutionType::Consumer(c)) => c,
                Ok(_) => {
                    error!(label = component.label, "invalid execution type for consumer");
                    continue;
                }
                Err(e) => {
                    error!(
                        label = component.label,
                        error = format!("{e}"),
                        "consumer construction failed, entry skipped"
                    );
                    continue;
                }
            };
            let chain = match build_chain(&component.modulators).await {
                Ok(chain) => Arc::new(chain),
                Err(e) => {
                    error!(
                        label = component.label,
                        error = format!("{e}"),
                        "consumer modulators failed, entry skipped"
                    );
                    continue;
                }
            };
            let state = StateCell::new();
            all_states.push(Arc::clone(&state));
            let ctx = ConsumerContext {
                label: Arc::from(component.label.as_str()),
                state,
                chain,
                streams: component.streams.iter().map(|s| names.intern(s)).collect(),
                net: Arc::clone(&net),
                telemetry: self.telemetry.clone(),
            };
            let control = hub.register_consumer();
            let _ = consumers_set.spawn(run_consumer(plugin, control, ctx));
            started_consumers += 1;
        }
        if started_consumers == 0 {
            return Err(Error::Validation("no consumer could be constructed".into()));
        }

        // health endpoint
        let pipeline_states = all_states.clone();
        health_registry.register(
            "/health",
            Arc::new(move || {
                let all_active = pipeline_states
                    .iter()
                    .all(|s| s.get() == PluginState::Active);
                if all_active {
                    (200, "OK\n".to_string())
                } else {
                    (503, "not all components active\n".to_string())
                }
            }),
        );
        let health_task = self.config.health_addr.clone().map(|addr| {
            let registry = health_registry.clone();
            tokio::spawn(async move {
                if let Err(e) = health::serve(addr, registry).await {
                    error!(error = format!("{e}"), "health endpoint failed");
                }
            })
        });

        hub.broadcast_all(ControlSignal::Start).await;
        self.report_ready(&all_states).await;
        info!(label = self.config.label, "pipeline started");

        let run_result = self
            .supervise(&mut consumers_set, &mut producers_set, &hub)
            .await;

        if let Some(task) = health_task {
            task.abort();
        }

        match &run_result {
            Ok(()) => info!("pipeline finished"),
            Err(e) => error!(error = format!("{e}"), "pipeline finished with error"),
        }
        run_result
    }

    /// Waits briefly for every component to reach Active, then fires the
    /// startup marker.
    async fn report_ready(&self, states: &[Arc<StateCell>]) {
        let deadline = std::time::Instant::now() + STARTUP_WAIT;
        loop {
            // a short-lived component that already drained counts as started
            if states.iter().all(|s| s.get() != PluginState::Initializing) {
                break;
            }
            if std::time::Instant::now() >= deadline {
                warn!("startup marker fired before every component reached Active");
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        if let Ok(mut ready) = self.ready.lock() {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Waits for the first shutdown trigger, then runs the staged
    /// shutdown sequence.
    async fn supervise(
        &self,
        consumers: &mut JoinSet<Result<(), Error>>,
        producers: &mut JoinSet<Result<(), Error>>,
        hub: &ControlHub,
    ) -> Result<(), Error> {
        let mut failure: Option<Error> = None;

        let run_deadline = self.timeout;
        let deadline_sleep = async move {
            match run_deadline {
                Some(d) => sleep(d).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                res = consumers.join_next() => match res {
                    None => {
                        debug!("all consumers finished");
                        break;
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!(error = format!("{e}"), "consumer failed, shutting down");
                        failure = Some(e);
                        break;
                    }
                    Some(Err(join_err)) => {
                        if join_err.is_panic() {
                            error!(panic = format!("{join_err}"), "consumer task panicked, shutting down");
                        }
                        failure = Some(Error::ExecutionError(format!("{join_err}")));
                        break;
                    }
                },
                res = producers.join_next(), if !producers.is_empty() => match res {
                    // producers only exit after a Stop signal; an early
                    // exit means the egress side died
                    None => break,
                    Some(Ok(Ok(()))) => {
                        warn!("producer exited before shutdown");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = format!("{e}"), "producer failed, shutting down");
                        failure = Some(e);
                        break;
                    }
                    Some(Err(join_err)) => {
                        if join_err.is_panic() {
                            error!(panic = format!("{join_err}"), "producer task panicked, shutting down");
                        }
                        failure = Some(Error::ExecutionError(format!("{join_err}")));
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, initiating graceful shutdown");
                    break;
                }
                _ = terminate_signal() => {
                    info!("received terminate signal, initiating graceful shutdown");
                    break;
                }
                _ = hangup_signal() => {
                    info!("received hangup signal, rolling file producers");
                    hub.broadcast_producers(ControlSignal::Roll).await;
                }
                _ = &mut deadline_sleep => {
                    debug!("run duration elapsed");
                    break;
                }
            }
        }

        let shutdown = self.shutdown_sequence(consumers, producers, hub).await;
        match failure {
            Some(e) => Err(e),
            None => shutdown,
        }
    }

    /// Staged shutdown: consumers PrepareStop then Stop and drain, then
    /// producers Stop and drain, then the hard deadline aborts stragglers.
    /// A second interrupt while draining forces the hard path immediately.
    async fn shutdown_sequence(
        &self,
        consumers: &mut JoinSet<Result<(), Error>>,
        producers: &mut JoinSet<Result<(), Error>>,
        hub: &ControlHub,
    ) -> Result<(), Error> {
        let deadline = self.config.shutdown_timeout;

        hub.broadcast_consumers(ControlSignal::PrepareStop).await;
        hub.broadcast_consumers(ControlSignal::Stop).await;
        let consumers_done = drain(consumers, deadline).await;

        // consumers are quiet; producers flush what the routers enqueued
        hub.broadcast_producers(ControlSignal::Stop).await;
        let producers_done = drain(producers, deadline).await;

        if !consumers_done || !producers_done {
            warn!("shutdown deadline exceeded, aborting remaining tasks");
            consumers.abort_all();
            producers.abort_all();
            while consumers.join_next().await.is_some() {}
            while producers.join_next().await.is_some() {}
            return Err(Error::ShutdownDeadlineExceeded);
        }
        Ok(())
    }
}

/// Joins every task in the set, true when the set quiesced before the
/// deadline. A second interrupt cuts the wait short.
async fn drain(set: &mut JoinSet<Result<(), Error>>, deadline: Duration) -> bool {
    let drained = async {
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = format!("{e}"), "task failed during shutdown"),
                Err(join_err) => {
                    if join_err.is_panic() {
                        error!(panic = format!("{join_err}"), "task panicked during shutdown");
                    }
                }
            }
        }
    };
    tokio::select! {
        res = timeout(deadline, drained) => res.is_ok(),
        _ = tokio::signal::ctrl_c() => {
            warn!("second interrupt, forcing shutdown");
            false
        }
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let _ = sigterm.recv().await;
            }
            Err(_) => futures::future::pending().await,
        }
    }
    #[cfg(not(unix))]
    futures::future::pending::<()>().await
}

async fn hangup_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut sighup) => {
                let _ = sighup.recv().await;
            }
            Err(_) => futures::future::pending().await,
        }
    }
    #[cfg(not(unix))]
    futures::future::pending::<()>().await
}

async fn construct(item: &crate::config::ParsedRegisteredItem) -> Result<ExecutionType, Error> {
    (item.creator)(item.config.clone()).await
}

async fn build_chain(modulators: &[ParsedModulator]) -> Result<ModulatorChain, Error> {
    let mut chain = Vec::with_capacity(modulators.len());
    for parsed in modulators {
        match construct(&parsed.item).await? {
            ExecutionType::Filter(f) => chain.push(Modulator::Filter(f)),
            ExecutionType::Formatter(f) => chain.push(Modulator::Formatter(f)),
            _ => {
                return Err(Error::Validation(
                    "modulator entry is not a filter or formatter".into(),
                ))
            }
        }
    }
    Ok(ModulatorChain::new(chain))
}

fn attached_producers(specs: &[ProducerSpec], stream: StreamId) -> Vec<ProducerHandle> {
    specs
        .iter()
        .filter(|spec| {
            spec.streams.contains(&stream) || spec.streams.contains(&StreamId::wildcard())
        })
        .map(|spec| spec.handle.clone())
        .collect()
}

fn wildcard_producers(specs: &[ProducerSpec]) -> Vec<ProducerHandle> {
    specs
        .iter()
        .filter(|spec| spec.streams.contains(&StreamId::wildcard()))
        .map(|spec| spec.handle.clone())
        .collect()
}
