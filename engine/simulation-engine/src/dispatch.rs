//! Dispatch and backpressure control
//!
//! The per-invocation execution path: admission control first, then value
//! resolution, payload construction and transport. The admission rule is a
//! closed loop: when the backend lags behind the schedule, updates trade
//! latency (a re-enqueue after `delay_ms`) for bounded concurrency instead of
//! dropping or queuing without limit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;

use interpolation::{ResolutionContext, ValueError};
use protocol_emitter::{
    build_device_update, build_entity_update, EmitterError, OutboundUpdate, ResolvedAttribute,
    ResolvedDevice, ResolvedEntity, ResolvedMetadata,
};

use crate::config::AttributeConfig;
use crate::context::RunContext;
use crate::events::SimulationEvent;
use crate::jobs::{Job, JobQueue, PlannedElement};

/// Execute one job invocation
pub async fn run_job(ctx: &RunContext, queue: &JobQueue, job: &Arc<Job>) {
    let counters = &ctx.counters;
    counters.updates_processed.fetch_add(1, Ordering::SeqCst);

    // Admission control, evaluated before doing any work
    let margin = ctx.options.maximum_not_responded;
    if margin >= 0 {
        let outstanding = counters.requested() - counters.responded();
        let admitted_backlog =
            counters.processed() - counters.delayed() - counters.requested();
        if outstanding > margin || admitted_backlog > margin + 1 {
            counters.delayed_update_requests.fetch_add(1, Ordering::SeqCst);
            let fire_at = ctx.clock.now() + Duration::milliseconds(ctx.options.delay_ms as i64);
            tracing::info!(
                job = %job.name,
                outstanding,
                margin,
                "update delayed by backpressure"
            );
            queue.schedule(fire_at, job.clone(), false);
            return;
        }
    }

    let update = match build_update(ctx, job).await {
        Ok(Some(update)) => update,
        Ok(None) => return,
        Err(e) => {
            let fatal = e.is_fatal();
            ctx.emit(SimulationEvent::Error { error: e.to_string(), request: None });
            if fatal {
                tracing::error!(job = %job.name, "fatal dispatch error: {e}");
                ctx.request_stop();
            }
            return;
        }
    };

    ctx.counters.updates_requested.fetch_add(1, Ordering::SeqCst);
    ctx.emit(SimulationEvent::UpdateRequest { request: update.clone() });

    match ctx.gateway.deliver(&update).await {
        Ok(response) => {
            ctx.counters.updates_responded.fetch_add(1, Ordering::SeqCst);
            ctx.emit(SimulationEvent::UpdateResponse { request: update, response });
        }
        Err(e) => {
            ctx.counters.updates_responded.fetch_add(1, Ordering::SeqCst);
            ctx.counters.error_update_requests.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(job = %job.name, "update delivery failed: {e}");
            ctx.emit(SimulationEvent::Error { error: e.to_string(), request: Some(update) });
        }
    }
}

/// Build the outbound update for a job, or `None` when nothing resolved
async fn build_update(
    ctx: &RunContext,
    job: &Arc<Job>,
) -> Result<Option<OutboundUpdate>, crate::error::SimulationError> {
    let token = ctx.token.read().clone();
    match &job.element {
        PlannedElement::Entity { entity_name, entity_type, static_attributes } => {
            let static_resolved = resolve_attributes(ctx, static_attributes).await;
            let active_resolved = resolve_attributes(ctx, &job.attributes).await;
            if static_resolved.is_empty() && active_resolved.is_empty() {
                return Ok(None);
            }
            let entity = ResolvedEntity {
                entity_name: entity_name.clone(),
                entity_type: entity_type.clone(),
                static_attributes: static_resolved,
                active_attributes: active_resolved,
            };
            let route = ctx.entity_route.as_ref().ok_or_else(|| {
                crate::error::SimulationError::ConfigurationNotValid(format!(
                    "entity '{entity_name}' scheduled without a context broker or subscriber"
                ))
            })?;
            Ok(Some(build_entity_update(route, &entity, token.as_deref())?))
        }
        PlannedElement::Device { device_id, api_key, protocol } => {
            let mut values = Vec::new();
            for attribute in &job.attributes {
                if let Some(value) = resolve_value(ctx, attribute).await {
                    values.push((attribute.identifier().to_string(), value));
                }
            }
            if values.is_empty() {
                return Ok(None);
            }
            let device = ResolvedDevice {
                device_id: device_id.clone(),
                api_key: api_key.clone(),
                protocol: *protocol,
                values,
            };
            let route = match protocol {
                p if p.is_mqtt() => None,
                protocol_emitter::DeviceProtocol::UltraLightHttp => ctx.ultralight_route.as_ref(),
                _ => ctx.json_route.as_ref(),
            };
            // MQTT devices route through the shared client; HTTP needs an agent
            let route = match route {
                Some(route) => route.clone(),
                None if protocol.is_mqtt() => protocol_emitter::DeviceRoute {
                    http_base_url: None,
                    service: None,
                    subservice: None,
                },
                None => {
                    return Err(EmitterError::NoTransport(format!(
                        "HTTP agent for device '{device_id}'"
                    ))
                    .into())
                }
            };
            Ok(Some(build_device_update(&route, &device, token.as_deref())?))
        }
    }
}

/// Resolve an attribute set; failures become error events and the attribute
/// is skipped without aborting the run
async fn resolve_attributes(
    ctx: &RunContext,
    attributes: &[AttributeConfig],
) -> Vec<ResolvedAttribute> {
    let mut resolved = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        let Some(value) = resolve_value(ctx, attribute).await else { continue };
        let mut metadata = Vec::with_capacity(attribute.metadata.len());
        for entry in &attribute.metadata {
            match resolve_raw(ctx, &entry.value).await {
                Ok(value) => metadata.push(ResolvedMetadata {
                    name: entry.name.clone(),
                    meta_type: entry.meta_type.clone(),
                    value,
                }),
                Err(e) => report_resolution_error(ctx, attribute, e),
            }
        }
        resolved.push(ResolvedAttribute {
            name: attribute.identifier().to_string(),
            attr_type: attribute.attr_type.clone(),
            value,
            metadata,
        });
    }
    resolved
}

async fn resolve_value(ctx: &RunContext, attribute: &AttributeConfig) -> Option<serde_json::Value> {
    match resolve_raw(ctx, &attribute.value).await {
        Ok(value) => Some(value),
        Err(e) => {
            report_resolution_error(ctx, attribute, e);
            None
        }
    }
}

async fn resolve_raw(
    ctx: &RunContext,
    raw: &serde_json::Value,
) -> Result<serde_json::Value, ValueError> {
    let context = ResolutionContext { now: ctx.clock.now(), token: ctx.token.read().clone() };
    ctx.resolver.resolve(raw, &context).await
}

fn report_resolution_error(ctx: &RunContext, attribute: &AttributeConfig, error: ValueError) {
    tracing::warn!(attribute = attribute.identifier(), "value resolution failed: {error}");
    let error: crate::error::SimulationError = error.into();
    ctx.emit(SimulationEvent::Error { error: error.to_string(), request: None });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::context::RunOptions;
    use crate::events::EventFeed;
    use crate::schedule::Schedule;
    use async_trait::async_trait;
    use interpolation::{script::NoLookup, Resolver};
    use parking_lot::RwLock;
    use protocol_emitter::{
        BrokerDestination, DeliveryReport, DeviceProtocol, EntityRoute, NgsiVersion, UpdateGateway,
    };
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    /// Discards every update
    pub struct NullGateway;

    #[async_trait]
    impl UpdateGateway for NullGateway {
        async fn deliver(&self, _update: &OutboundUpdate) -> Result<DeliveryReport, EmitterError> {
            Ok(DeliveryReport { status: Some(204), body: None })
        }
    }

    /// Records updates and holds each response until released
    pub struct HoldingGateway {
        pub release: Notify,
        pub calls: RwLock<Vec<OutboundUpdate>>,
    }

    #[async_trait]
    impl UpdateGateway for HoldingGateway {
        async fn deliver(&self, update: &OutboundUpdate) -> Result<DeliveryReport, EmitterError> {
            self.calls.write().push(update.clone());
            self.release.notified().await;
            Ok(DeliveryReport { status: Some(204), body: None })
        }
    }

    fn entity_route() -> EntityRoute {
        EntityRoute {
            base_url: "https://broker:1026".to_string(),
            version: NgsiVersion::V2,
            destination: BrokerDestination::ContextBroker,
            path: None,
            service: None,
            subservice: None,
        }
    }

    fn context_with(gateway: Arc<dyn UpdateGateway>, margin: i64) -> RunContext {
        RunContext::new(
            RunOptions { maximum_not_responded: margin, delay_ms: 50, ..Default::default() },
            SimClock::real(),
            EventFeed::new(),
            Arc::new(RwLock::new(None)),
            Resolver::new(Arc::new(NoLookup)),
            gateway,
            Some(entity_route()),
            None,
            None,
        )
    }

    fn entity_job(value: Value) -> Arc<Job> {
        Arc::new(Job {
            name: "E1|a".to_string(),
            element: PlannedElement::Entity {
                entity_name: "E1".to_string(),
                entity_type: "Room".to_string(),
                static_attributes: vec![],
            },
            attributes: vec![AttributeConfig {
                name: Some("a".to_string()),
                object_id: None,
                attr_type: "Number".to_string(),
                value,
                metadata: vec![],
                schedule: None,
            }],
            schedule: Schedule::Once,
        })
    }

    #[tokio::test]
    async fn test_first_firing_dispatches_immediately_with_zero_margin() {
        let ctx = context_with(Arc::new(NullGateway), 0);
        let queue = JobQueue::new();
        run_job(&ctx, &queue, &entity_job(json!(0))).await;
        assert_eq!(ctx.counters.processed(), 1);
        assert_eq!(ctx.counters.requested(), 1);
        assert_eq!(ctx.counters.responded(), 1);
        assert_eq!(ctx.counters.delayed(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_second_firing_before_response_is_delayed() {
        let gateway = Arc::new(HoldingGateway { release: Notify::new(), calls: RwLock::new(vec![]) });
        let ctx = Arc::new(context_with(gateway.clone(), 0));
        let queue = Arc::new(JobQueue::new());

        let first_ctx = ctx.clone();
        let first_queue = queue.clone();
        let first = tokio::spawn(async move {
            run_job(&first_ctx, &first_queue, &entity_job(json!(1))).await;
        });
        // Wait for the first dispatch to be in flight
        while gateway.calls.read().is_empty() {
            tokio::task::yield_now().await;
        }

        run_job(&ctx, &queue, &entity_job(json!(2))).await;
        assert_eq!(ctx.counters.delayed(), 1);
        assert_eq!(queue.len(), 1, "delayed update re-enqueued as a one-shot");

        gateway.release.notify_one();
        first.await.unwrap();
        assert_eq!(ctx.counters.responded(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_counts_and_reports() {
        struct FailingGateway;
        #[async_trait]
        impl UpdateGateway for FailingGateway {
            async fn deliver(
                &self,
                _update: &OutboundUpdate,
            ) -> Result<DeliveryReport, EmitterError> {
                Err(EmitterError::UnexpectedStatus { status: 500, body: "boom".to_string() })
            }
        }
        let ctx = context_with(Arc::new(FailingGateway), -1);
        let mut receiver = ctx.feed.subscribe();
        let queue = JobQueue::new();
        run_job(&ctx, &queue, &entity_job(json!(1))).await;
        assert_eq!(ctx.counters.errors(), 1);
        assert_eq!(ctx.counters.responded(), 1);
        let names: Vec<&str> = std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|event| event.name())
            .collect();
        assert_eq!(names, vec!["update-request", "error"]);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_reported_and_skipped() {
        let ctx = context_with(Arc::new(NullGateway), -1);
        let mut receiver = ctx.feed.subscribe();
        let queue = JobQueue::new();
        // Malformed payload: recognized prefix, bad JSON
        run_job(&ctx, &queue, &entity_job(json!("time-linear-interpolator(nonsense)"))).await;
        assert_eq!(ctx.counters.requested(), 0);
        let names: Vec<&str> = std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|event| event.name())
            .collect();
        assert_eq!(names, vec!["error"]);
        assert!(!ctx.is_stopping(), "resolution failures never end the run");
    }

    #[tokio::test]
    async fn test_mqtt_device_update_builds_topic() {
        let ctx = context_with(Arc::new(NullGateway), -1);
        let queue = JobQueue::new();
        let job = Arc::new(Job {
            name: "D1|t".to_string(),
            element: PlannedElement::Device {
                device_id: "D1".to_string(),
                api_key: "k".to_string(),
                protocol: DeviceProtocol::UltraLightMqtt,
            },
            attributes: vec![AttributeConfig {
                name: None,
                object_id: Some("t".to_string()),
                attr_type: String::new(),
                value: json!(21.5),
                metadata: vec![],
                schedule: None,
            }],
            schedule: Schedule::Once,
        });
        run_job(&ctx, &queue, &job).await;
        assert_eq!(ctx.counters.requested(), 1);
    }
}
