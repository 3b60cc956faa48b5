//! Simulation controller
//!
//! Wires the run context, plans jobs, drives the scheduler loop (real or
//! fast-forward) and guarantees exactly one `end` event per run, whether the
//! run completes naturally, is stopped explicitly, or dies on a fatal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use interpolation::{script::NoLookup, AttributeLookup, Resolver};
use protocol_emitter::{
    BrokerDestination, BrokerLookup, DeviceRoute, Emitter, EntityRoute, NgsiVersion, UpdateGateway,
};

use crate::clock::SimClock;
use crate::config::{AcceptAll, ConfigTranspiler, ConfigValidator, SimulationConfig};
use crate::context::{RunContext, RunOptions};
use crate::dispatch;
use crate::error::SimulationError;
use crate::events::{EventFeed, ProgressSnapshot, SimulationEvent};
use crate::jobs::{Job, JobQueue};
use crate::planner;
use crate::schedule::Schedule;
use crate::token::{HttpTokenFetcher, TokenFetcher, TokenManager};

/// Injectable components, for tests and embedders
#[derive(Default)]
pub struct Components {
    pub gateway: Option<Arc<dyn UpdateGateway>>,
    pub token_fetcher: Option<Arc<dyn TokenFetcher>>,
}

/// A running simulation
pub struct Simulation {
    ctx: Arc<RunContext>,
    queue: Arc<JobQueue>,
    ended: Arc<AtomicBool>,
    done_rx: watch::Receiver<bool>,
}

impl Simulation {
    /// Start a run with the default collaborators and real transports
    pub async fn start(
        config: SimulationConfig,
        options: RunOptions,
    ) -> Result<Simulation, SimulationError> {
        Self::start_with(config, options, &AcceptAll, &AcceptAll, Components::default()).await
    }

    /// Start a run with explicit collaborators and components.
    ///
    /// Configuration problems are fatal before any job is scheduled: they are
    /// returned here and no events are emitted.
    pub async fn start_with(
        config: SimulationConfig,
        options: RunOptions,
        validator: &dyn ConfigValidator,
        transpiler: &dyn ConfigTranspiler,
        components: Components,
    ) -> Result<Simulation, SimulationError> {
        let config = transpiler.transpile(validator.validate(config)?)?;
        let config = config.expanded()?;

        let entity_route = entity_route(&config)?;
        if !config.entities.is_empty() && entity_route.is_none() {
            return Err(SimulationError::ConfigurationNotValid(
                "entities configured without a context broker or subscriber".to_string(),
            ));
        }
        let (ultralight_route, json_route) = device_routes(&config);

        // Jobs are planned up front so configuration errors stay pre-run;
        // scheduling itself waits for the first successful token.
        let jobs = planner::plan(&config)?;

        let clock = match options.from_date {
            Some(from) => SimClock::virtual_from(from),
            None => SimClock::real(),
        };
        let token_cell = Arc::new(RwLock::new(None));

        let lookup: Arc<dyn AttributeLookup> = match &config.context_broker {
            Some(broker) => Arc::new(BrokerLookup::new(
                broker.base_url(),
                NgsiVersion::parse(&broker.ngsi_version)?,
                config.domain.as_ref().map(|domain| domain.service.clone()),
                config.domain.as_ref().map(|domain| domain.subservice.clone()),
                token_cell.clone(),
            )?),
            None => Arc::new(NoLookup),
        };

        let gateway: Arc<dyn UpdateGateway> = match components.gateway {
            Some(gateway) => gateway,
            None => Arc::new(Emitter::new(mqtt_endpoint(&config))?),
        };

        let token_manager = match &config.authentication {
            Some(auth) => {
                let fetcher: Arc<dyn TokenFetcher> = match components.token_fetcher {
                    Some(fetcher) => fetcher,
                    None => Arc::new(HttpTokenFetcher::new(auth.clone(), config.domain.clone())?),
                };
                Some(Arc::new(TokenManager::new(fetcher, auth.retry.clone())))
            }
            None => None,
        };

        let ctx = Arc::new(RunContext::new(
            options,
            clock,
            EventFeed::new(),
            token_cell,
            Resolver::new(lookup),
            gateway,
            entity_route,
            ultralight_route,
            json_route,
        ));
        let queue = Arc::new(JobQueue::new());
        let ended = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);

        let simulation =
            Simulation { ctx: ctx.clone(), queue: queue.clone(), ended: ended.clone(), done_rx };
        tokio::spawn(run(ctx, queue, jobs, token_manager, ended, done_tx));
        Ok(simulation)
    }

    /// Subscribe to the event feed
    pub fn events(&self) -> broadcast::Receiver<SimulationEvent> {
        self.ctx.feed.subscribe()
    }

    /// Stop the run: cancels every outstanding job and ends the feed with
    /// `stop` followed by the final `end`. Idempotent.
    pub fn stop(&self) {
        if self.is_ended() || self.ctx.is_stopping() {
            return;
        }
        tracing::info!("simulation stop requested");
        self.ctx.feed.emit(SimulationEvent::Stop);
        self.queue.clear();
        self.ctx.request_stop();
    }

    /// True once the final `end` event was emitted
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Wait for the run to end
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Current simulation time
    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.ctx.clock.now()
    }
}

fn entity_route(config: &SimulationConfig) -> Result<Option<EntityRoute>, SimulationError> {
    let domain = config.domain.as_ref();
    if let Some(broker) = &config.context_broker {
        return Ok(Some(EntityRoute {
            base_url: broker.base_url(),
            version: NgsiVersion::parse(&broker.ngsi_version)?,
            destination: BrokerDestination::ContextBroker,
            path: None,
            service: domain.map(|d| d.service.clone()),
            subservice: domain.map(|d| d.subservice.clone()),
        }));
    }
    if let Some(subscriber) = &config.subscriber {
        return Ok(Some(EntityRoute {
            base_url: subscriber.base_url(),
            version: NgsiVersion::parse(&subscriber.ngsi_version)?,
            destination: BrokerDestination::Subscriber,
            path: subscriber.path.clone(),
            service: domain.map(|d| d.service.clone()),
            subservice: domain.map(|d| d.subservice.clone()),
        }));
    }
    Ok(None)
}

fn device_routes(config: &SimulationConfig) -> (Option<DeviceRoute>, Option<DeviceRoute>) {
    let domain = config.domain.as_ref();
    let route = |http: Option<String>| DeviceRoute {
        http_base_url: http,
        service: domain.map(|d| d.service.clone()),
        subservice: domain.map(|d| d.subservice.clone()),
    };
    let agent = config.iot_agent.as_ref();
    let ultralight = agent
        .and_then(|a| a.ultralight.as_ref())
        .and_then(|endpoints| endpoints.http.as_ref())
        .map(|http| route(Some(http.base_url())));
    let json = agent
        .and_then(|a| a.json.as_ref())
        .and_then(|endpoints| endpoints.http.as_ref())
        .map(|http| route(Some(http.base_url())));
    (ultralight, json)
}

/// One shared MQTT client per run: the first configured MQTT endpoint wins
fn mqtt_endpoint(config: &SimulationConfig) -> Option<protocol_emitter::MqttEndpoint> {
    let agent = config.iot_agent.as_ref()?;
    agent
        .ultralight
        .as_ref()
        .and_then(|endpoints| endpoints.mqtt.clone())
        .or_else(|| agent.json.as_ref().and_then(|endpoints| endpoints.mqtt.clone()))
}

/// The run task: token, scheduling, the scheduler loop, and the final `end`
async fn run(
    ctx: Arc<RunContext>,
    queue: Arc<JobQueue>,
    jobs: Vec<Arc<Job>>,
    token_manager: Option<Arc<TokenManager>>,
    ended: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
) {
    let finish = |ctx: &RunContext| {
        ctx.request_stop();
        queue.clear();
        if !ended.swap(true, Ordering::SeqCst) {
            ctx.feed.emit(SimulationEvent::End);
            tracing::info!("simulation ended");
        }
        let _ = done_tx.send(true);
    };

    // Authentication gates scheduling: no jobs without a first token
    if let Some(manager) = &token_manager {
        match manager.obtain(&ctx).await {
            Ok(grant) => {
                ctx.emit(SimulationEvent::TokenRequestScheduled {
                    scheduled_at: TokenManager::refresh_at(&grant),
                });
                let manager = manager.clone();
                let refresh_ctx = ctx.clone();
                tokio::spawn(async move {
                    manager.run_refresh_loop(refresh_ctx, grant).await;
                });
            }
            Err(e) => {
                tracing::error!("authentication failed, ending run: {e}");
                ctx.emit(SimulationEvent::Error { error: e.to_string(), request: None });
                finish(&ctx);
                return;
            }
        }
    }
    if ctx.is_stopping() {
        finish(&ctx);
        return;
    }

    // Schedule every planned job
    let now = ctx.clock.now();
    for job in &jobs {
        ctx.emit(SimulationEvent::UpdateScheduled {
            job: job.name.clone(),
            schedule: job.schedule.describe(),
            element: job.element.identity_json(),
            attributes: scheduled_attribute_names(job),
        });
        if let Some(first) = job.schedule.first_after(now) {
            let recurring = !matches!(job.schedule, Schedule::Once);
            queue.schedule(first, job.clone(), recurring);
        }
    }

    let progress = ctx.options.progress_interval_ms.map(|interval_ms| {
        let ctx = ctx.clone();
        tokio::spawn(run_progress_loop(ctx, interval_ms))
    });

    if ctx.clock.is_virtual() {
        run_virtual_loop(&ctx, &queue).await;
    } else {
        run_real_loop(&ctx, &queue).await;
    }

    if let Some(progress) = progress {
        progress.abort();
    }
    finish(&ctx);
}

/// Names reported by `update-scheduled`: scheduled attributes plus the
/// entity's static attributes
fn scheduled_attribute_names(job: &Job) -> Vec<String> {
    let mut names: Vec<String> =
        job.attributes.iter().map(|attribute| attribute.identifier().to_string()).collect();
    if let crate::jobs::PlannedElement::Entity { static_attributes, .. } = &job.element {
        names.extend(static_attributes.iter().map(|attribute| attribute.identifier().to_string()));
    }
    names
}

/// Wall-clock scheduler: sleeps until the next invocation, fires everything
/// due, and ends once no invocations remain and nothing is in flight.
async fn run_real_loop(ctx: &Arc<RunContext>, queue: &Arc<JobQueue>) {
    loop {
        if ctx.is_stopping() {
            return;
        }
        let Some(fire_at) = queue.next_fire_time() else {
            if ctx.in_flight() == 0 && queue.is_empty() {
                return;
            }
            tokio::select! {
                _ = ctx.stopped() => return,
                _ = ctx.idle() => continue,
                _ = queue.notify.notified() => continue,
            }
        };

        let now = Utc::now();
        if fire_at > now {
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = ctx.stopped() => return,
                _ = tokio::time::sleep(wait) => {}
                // A re-enqueue may have introduced an earlier invocation
                _ = queue.notify.notified() => continue,
            }
        }

        for due in queue.pop_due(Utc::now()) {
            spawn_dispatch(ctx.clone(), queue.clone(), due.job.clone());
            if due.recurring {
                if let Some(next) = due.job.schedule.next_after(due.fire_at) {
                    queue.schedule(next, due.job, true);
                }
            }
        }
    }
}

/// Fast-forward scheduler: advances the virtual clock straight to each
/// pending invocation and awaits every round-trip before moving on.
async fn run_virtual_loop(ctx: &Arc<RunContext>, queue: &Arc<JobQueue>) {
    loop {
        if ctx.is_stopping() {
            return;
        }
        let Some(fire_at) = queue.next_fire_time() else {
            // No pending invocations: the fast-forward run is complete
            return;
        };
        if let Some(to) = ctx.options.to_date {
            if fire_at > to {
                tracing::info!(%to, "virtual clock reached the end of the window");
                return;
            }
        }
        ctx.clock.advance_to(fire_at);
        for due in queue.pop_due(fire_at) {
            dispatch::run_job(ctx, queue, &due.job).await;
            if due.recurring {
                if let Some(next) = due.job.schedule.next_after(due.fire_at) {
                    queue.schedule(next, due.job.clone(), true);
                }
            }
        }
    }
}

fn spawn_dispatch(ctx: Arc<RunContext>, queue: Arc<JobQueue>, job: Arc<Job>) {
    ctx.dispatch_started();
    tokio::spawn(async move {
        dispatch::run_job(&ctx, &queue, &job).await;
        ctx.dispatch_finished();
    });
}

async fn run_progress_loop(ctx: Arc<RunContext>, interval_ms: u64) {
    let started = Instant::now();
    let simulation_start = ctx.clock.now();
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = ctx.stopped() => return,
            _ = interval.tick() => {}
        }
        let counters = &ctx.counters;
        ctx.emit(SimulationEvent::ProgressInfo(ProgressSnapshot {
            updates_processed: counters.processed(),
            updates_requested: counters.requested(),
            delayed_update_requests: counters.delayed(),
            error_update_requests: counters.errors(),
            elapsed_time_ms: started.elapsed().as_millis() as i64,
            simulated_elapsed_time_ms: (ctx.clock.now() - simulation_start).num_milliseconds(),
        }));
    }
}
