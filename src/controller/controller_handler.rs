use crate::accounting::accountant::TrafficAccountant;
use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::registry::user_registry::UserRegistry;
use crate::status::reader::StatusReader;
use crate::status::types::{Observation, UnavailableReason};
use crate::status::watcher::{StatusFileWatcher, WatchTrigger};
use crate::traffic_log::logger::{FileSink, LogSink, TrafficLogger};
use crate::watchlist::monitor::WatchlistMonitor;
use crate::watchlist::observer::{CaptureFilter, DestinationObserver, NullObserver, TcpdumpObserver};
use crate::watchlist::resolver::{resolve_all, HostResolver, SystemResolver};
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};

type Resolutions = Vec<(String, Result<HashSet<IpAddr>, WatchError>)>;
type ReadOutcome = (StatusReader, Observation);

/// Owns every component and drives them from a single event loop.
///
/// Status reads and hostname resolution run as spawned tasks whose results
/// come back into the loop, so neither can hold up the watchlist timer. All
/// mutable state (accounting, watchlist, cached registry) is only touched
/// from the loop itself.
pub struct Controller {
    config: Arc<Config>,
    // Lent to the read task while a read is in flight.
    reader: Option<StatusReader>,
    registry: UserRegistry,
    accountant: TrafficAccountant,
    watchlist: WatchlistMonitor,
    observer: Box<dyn DestinationObserver>,
    resolver: Arc<dyn HostResolver>,
    logger: TrafficLogger,
}

impl Controller {
    /// Builds the production controller. Must be called inside a tokio runtime.
    pub fn new(config: Arc<Config>) -> Result<Self, ControllerError> {
        let registry = UserRegistry::open(&config.users_file, config.daemon.lock_timeout())?;
        info!(
            "Loaded {} registered users from {}",
            registry.len(),
            config.users_file.display()
        );

        let sink = FileSink::open(&config.traffic_log).map_err(|e| {
            ControllerError::InitializationFailed(format!(
                "cannot open traffic log {}: {}",
                config.traffic_log.display(),
                e
            ))
        })?;

        let observer: Box<dyn DestinationObserver> = if config.watchlist.is_empty() {
            info!("Watchlist is empty, destination capture disabled");
            Box::new(NullObserver)
        } else {
            Box::new(TcpdumpObserver::new(&config.network_interface))
        };

        let resolver = Arc::new(SystemResolver::new(config.daemon.resolve_timeout()));
        Ok(Self::with_parts(config, registry, Box::new(sink), resolver, observer))
    }

    /// Assembles a controller from already constructed collaborators.
    pub fn with_parts(
        config: Arc<Config>,
        registry: UserRegistry,
        sink: Box<dyn LogSink>,
        resolver: Arc<dyn HostResolver>,
        observer: Box<dyn DestinationObserver>,
    ) -> Self {
        let logger = TrafficLogger::new(
            sink,
            config.daemon.sink_retry_limit,
            config.daemon.sink_backoff(),
        );
        Self {
            watchlist: WatchlistMonitor::new(&config.watchlist),
            reader: Some(StatusReader::new(&config.status_file, config.daemon.read_timeout())),
            config,
            registry,
            accountant: TrafficAccountant::new(),
            observer,
            resolver,
            logger,
        }
    }

    pub fn accountant(&self) -> &TrafficAccountant {
        &self.accountant
    }

    pub fn watchlist(&self) -> &WatchlistMonitor {
        &self.watchlist
    }

    /// True while a timed out status read is still blocked.
    pub fn status_read_stalled(&self) -> bool {
        self.reader.as_ref().is_some_and(StatusReader::is_stalled)
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` completes or a fatal error occurs.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let result = self.event_loop(shutdown).await;
        if let Err(e) = self.logger.flush().await {
            warn!("Final traffic log flush failed: {}", e);
        }
        self.observer.stop();
        match &result {
            Ok(()) => info!("Monitor stopped"),
            Err(e) => error!("Monitor stopped on fatal error: {}", e),
        }
        result
    }

    async fn event_loop<F>(&mut self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let daemon = self.config.daemon.clone();
        let mut watcher = StatusFileWatcher::new(
            &self.config.status_file,
            daemon.debounce(),
            daemon.poll_interval(),
            daemon.file_notifications,
        );

        let mut watchlist_tick = interval(daemon.watchlist_interval());
        watchlist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resolve_tick = interval(daemon.resolve_interval());
        resolve_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut read_task: Option<JoinHandle<ReadOutcome>> = None;
        let mut read_again = false;
        let mut resolve_task: Option<JoinHandle<Resolutions>> = None;

        self.consistency_check();
        info!(
            "Monitoring {} with {} watchlist entries",
            self.config.status_file.display(),
            self.watchlist.entries().len()
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                trigger = watcher.next_trigger() => {
                    if read_task.is_some() {
                        trace!("Read in flight, coalescing {:?} trigger", trigger);
                        read_again = true;
                    } else {
                        if trigger == WatchTrigger::Changed {
                            debug!("Status file changed");
                        }
                        read_task = Some(self.spawn_read());
                    }
                }
                joined = join(&mut read_task), if read_task.is_some() => {
                    read_task = None;
                    let observation = self.settle_read(joined);
                    self.process_observation(observation).await?;
                    if read_again {
                        read_again = false;
                        read_task = Some(self.spawn_read());
                    }
                }
                _ = watchlist_tick.tick() => {
                    self.watchlist_cycle();
                    self.consistency_check();
                    if let Err(e) = self.logger.flush().await {
                        warn!("Traffic log flush failed: {}", e);
                    }
                }
                _ = resolve_tick.tick() => {
                    if resolve_task.is_none() {
                        resolve_task = self.spawn_resolution();
                    } else {
                        debug!("Previous hostname resolution still running");
                    }
                }
                joined = join(&mut resolve_task), if resolve_task.is_some() => {
                    resolve_task = None;
                    match joined {
                        Ok(results) => {
                            self.watchlist.apply_resolutions(results, Utc::now());
                            self.update_capture_targets();
                        }
                        Err(e) => warn!("Hostname resolution task failed: {}", e),
                    }
                }
            }
        }

        if let Some(task) = resolve_task.take() {
            task.abort();
        }
        if let Some(task) = read_task.take() {
            // bounded by the read timeout inside the task
            match timeout(daemon.read_timeout() + Duration::from_secs(1), task).await {
                Ok(joined) => {
                    let observation = self.settle_read(joined);
                    self.process_observation(observation).await?;
                }
                Err(_) => warn!("Abandoning status read still running at shutdown"),
            }
        }
        Ok(())
    }

    /// Applies one status read: accounting, logging and capture targets.
    ///
    /// Returns the number of traffic records written. An unavailable status
    /// file leaves every piece of state untouched.
    pub async fn process_observation(
        &mut self,
        observation: Observation,
    ) -> Result<usize, ControllerError> {
        let snapshot = match observation {
            Observation::Snapshot(s) => s,
            Observation::Unavailable(reason) => {
                match reason {
                    UnavailableReason::Missing
                    | UnavailableReason::Truncated
                    | UnavailableReason::Stalled => debug!("Skipping cycle: {}", reason),
                    _ => warn!("Skipping cycle: {}", reason),
                }
                return Ok(0);
            }
        };
        if snapshot.warnings > 0 {
            warn!(
                "Skipped {} malformed lines in {}",
                snapshot.warnings,
                self.config.status_file.display()
            );
        }

        // never wait on a lock held by an administrative invocation
        if let Err(e) = self.registry.refresh() {
            warn!("Keeping previously loaded users: {}", e);
        }

        let records = self
            .accountant
            .observe(&snapshot.sessions, &self.registry, Utc::now());
        self.logger.write_all(&records).await?;
        trace!(
            "Cycle done: {} sessions, {} records",
            snapshot.sessions.len(),
            records.len()
        );

        self.update_capture_targets();
        Ok(records.len())
    }

    /// Collects observed destinations and queues the resulting hits.
    pub fn watchlist_cycle(&mut self) {
        if self.watchlist.is_empty() {
            return;
        }
        let sessions = self.accountant.active_sessions();
        let observed = self.observer.drain();
        let hits = self.watchlist.evaluate(&sessions, &observed);
        if !hits.is_empty() {
            debug!("Queueing {} watchlist hits", hits.len());
            self.accountant.queue_watchlist_hits(hits);
        }
        self.update_capture_targets();
    }

    fn update_capture_targets(&mut self) {
        let filter = CaptureFilter::new(
            self.accountant
                .active_sessions()
                .into_iter()
                .map(|s| s.virtual_address),
            self.watchlist.destination_nets(),
        );
        self.observer.set_filter(&filter);
    }

    fn consistency_check(&self) {
        for issue in self.registry.consistency_report() {
            warn!("User registry: {}", issue);
        }
    }

    fn spawn_read(&mut self) -> JoinHandle<ReadOutcome> {
        let mut reader = self.reader.take().unwrap_or_else(|| {
            StatusReader::new(&self.config.status_file, self.config.daemon.read_timeout())
        });
        tokio::spawn(async move {
            let observation = reader.read().await;
            (reader, observation)
        })
    }

    /// Takes the reader back from a finished read task.
    fn settle_read(&mut self, joined: Result<ReadOutcome, JoinError>) -> Observation {
        match joined {
            Ok((reader, observation)) => {
                self.reader = Some(reader);
                observation
            }
            Err(e) => {
                warn!("Status read task failed: {}", e);
                Observation::Unavailable(UnavailableReason::Io(e.to_string()))
            }
        }
    }

    fn spawn_resolution(&self) -> Option<JoinHandle<Resolutions>> {
        let names = self.watchlist.hostnames();
        if names.is_empty() {
            return None;
        }
        debug!("Resolving {} watchlist hostnames", names.len());
        let resolver = Arc::clone(&self.resolver);
        Some(tokio::spawn(async move {
            resolve_all(resolver.as_ref(), names).await
        }))
    }
}

async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM ({}), only Ctrl-C stops the monitor", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
