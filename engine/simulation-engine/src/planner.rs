//! Schedule planning
//!
//! Groups every element's attributes by effective schedule (attribute-level
//! schedule overrides the element's, which defaults to `"once"`) and produces
//! one job per distinct schedule. Static-only entities still get one job on
//! their own schedule so their static attributes are sent.

use std::sync::Arc;

use protocol_emitter::DeviceProtocol;

use crate::config::{AttributeConfig, DeviceConfig, EntityConfig, SimulationConfig};
use crate::error::SimulationError;
use crate::jobs::{Job, PlannedElement};
use crate::schedule::{Schedule, ScheduleSpec};

/// Plan the jobs of an expanded configuration
pub fn plan(config: &SimulationConfig) -> Result<Vec<Arc<Job>>, SimulationError> {
    let mut jobs = Vec::new();
    for entity in &config.entities {
        plan_entity(entity, &mut jobs)?;
    }
    for device in &config.devices {
        plan_device(device, &mut jobs)?;
    }
    tracing::info!(jobs = jobs.len(), "schedule planning complete");
    Ok(jobs)
}

fn plan_entity(entity: &EntityConfig, jobs: &mut Vec<Arc<Job>>) -> Result<(), SimulationError> {
    let entity_name = entity
        .entity_name
        .clone()
        .ok_or_else(|| SimulationError::ConfigurationNotValid("entity without name".to_string()))?;
    let element = PlannedElement::Entity {
        entity_name,
        entity_type: entity.entity_type.clone(),
        static_attributes: entity.static_attributes.clone(),
    };

    let groups = group_by_schedule(entity.schedule.as_ref(), &entity.active)?;
    if groups.is_empty() {
        // Static-only entity: one job on the entity's own schedule
        let schedule = effective_schedule(entity.schedule.as_ref(), None)?;
        jobs.push(build_job(&element, schedule, Vec::new()));
        return Ok(());
    }
    for (schedule, attributes) in groups {
        jobs.push(build_job(&element, schedule, attributes));
    }
    Ok(())
}

fn plan_device(device: &DeviceConfig, jobs: &mut Vec<Arc<Job>>) -> Result<(), SimulationError> {
    let device_id = device
        .device_id
        .clone()
        .ok_or_else(|| SimulationError::ConfigurationNotValid("device without id".to_string()))?;
    let api_key = device.api_key.clone().ok_or_else(|| {
        SimulationError::ConfigurationNotValid(format!("device '{device_id}' without api_key"))
    })?;
    let protocol = DeviceProtocol::parse(&device.protocol)
        .map_err(|_| SimulationError::ProtocolNotSupported(device.protocol.clone()))?;
    let element = PlannedElement::Device { device_id, api_key, protocol };

    for (schedule, attributes) in group_by_schedule(device.schedule.as_ref(), &device.attributes)? {
        jobs.push(build_job(&element, schedule, attributes));
    }
    Ok(())
}

/// Group attributes by their effective schedule, preserving first-seen order
fn group_by_schedule(
    element_schedule: Option<&ScheduleSpec>,
    attributes: &[AttributeConfig],
) -> Result<Vec<(Schedule, Vec<AttributeConfig>)>, SimulationError> {
    let mut groups: Vec<(Schedule, Vec<AttributeConfig>)> = Vec::new();
    for attribute in attributes {
        let schedule = effective_schedule(element_schedule, attribute.schedule.as_ref())?;
        match groups.iter_mut().find(|(existing, _)| *existing == schedule) {
            Some((_, members)) => members.push(attribute.clone()),
            None => groups.push((schedule, vec![attribute.clone()])),
        }
    }
    Ok(groups)
}

fn effective_schedule(
    element_schedule: Option<&ScheduleSpec>,
    attribute_schedule: Option<&ScheduleSpec>,
) -> Result<Schedule, SimulationError> {
    match attribute_schedule.or(element_schedule) {
        Some(spec) => Schedule::parse(spec),
        None => Ok(Schedule::Once),
    }
}

/// Deterministic job name from the element identity and attribute names
fn build_job(element: &PlannedElement, schedule: Schedule, attributes: Vec<AttributeConfig>) -> Arc<Job> {
    let attribute_names: Vec<&str> =
        attributes.iter().map(AttributeConfig::identifier).collect();
    let name = format!("{}|{}", element.identity(), attribute_names.join(","));
    Arc::new(Job { name, element: element.clone(), attributes, schedule })
}
