//! Topology validation: checks a proposed set of node service types (and the
//! shape of the instances carrying them) against an engine's rules.
//!
//! Everything here is a pure function of the rules and the input.

use crate::config::TopologyRules;
use crate::error::ValidationError;
use crate::types::{InstanceDef, NodeId, NodeRecord, ServiceTypes};
use std::collections::HashSet;

/// Resolve and check the service types of every instance.
///
/// Instances without declared types get the engine defaults. Unknown types are
/// always rejected; coverage of the required types is only enforced for a
/// complete cluster (`for_grow == false`), while the per-node requirement of
/// engines with `require_all_services` applies to grown nodes too.
pub fn compute_types(
    engine: &str,
    instances: &[InstanceDef],
    rules: &TopologyRules,
    for_grow: bool,
) -> Result<Vec<ServiceTypes>, ValidationError> {
    let computed: Vec<ServiceTypes> = instances
        .iter()
        .map(|instance| {
            if instance.types.is_empty() {
                rules.default_types.clone()
            } else {
                ServiceTypes::new(instance.types.iter().map(|t| t.trim()))
            }
        })
        .collect();

    for types in &computed {
        if let Some(unknown) = types.difference(&rules.valid_types).next() {
            return Err(ValidationError::UnknownType {
                engine: engine.to_string(),
                service: unknown.to_string(),
                valid: rules.valid_types.to_string(),
            });
        }
    }

    let mut union = ServiceTypes::default();
    for types in &computed {
        if rules.require_all_services && !types.is_superset(&rules.required_types) {
            return Err(missing(&rules.required_types, types));
        }
        union.extend(types);
    }

    if !for_grow && !union.is_superset(&rules.required_types) {
        return Err(missing(&rules.required_types, &union));
    }

    Ok(computed)
}

fn missing(required: &ServiceTypes, present: &ServiceTypes) -> ValidationError {
    let missing: Vec<&str> = required.difference(present).collect();
    ValidationError::MissingRequiredType {
        missing: missing.join(","),
    }
}

/// Flavor and volume size must be the same on every instance.
pub fn check_homogeneous<'a, I>(instances: I) -> Result<(), ValidationError>
where
    I: IntoIterator<Item = &'a InstanceDef>,
{
    let mut flavors = HashSet::new();
    let mut volumes = HashSet::new();
    for instance in instances {
        flavors.insert(instance.flavor.as_str());
        volumes.insert(instance.volume_size);
    }

    if flavors.len() > 1 {
        return Err(ValidationError::FlavorsNotEqual);
    }
    if volumes.len() > 1 {
        return Err(ValidationError::VolumeSizesNotEqual);
    }
    Ok(())
}

/// Volume sizes must match the engine's volume support.
pub fn check_volumes(
    engine: &str,
    instances: &[InstanceDef],
    rules: &TopologyRules,
) -> Result<(), ValidationError> {
    for instance in instances {
        match (rules.volume_support, instance.volume_size) {
            (true, None) | (true, Some(0)) => {
                return Err(ValidationError::VolumeSizeRequired {
                    engine: engine.to_string(),
                })
            }
            (false, Some(_)) => {
                return Err(ValidationError::VolumeNotSupported {
                    engine: engine.to_string(),
                })
            }
            _ => {}
        }
    }
    Ok(())
}

/// Full check of a cluster-create request. Returns the service types per instance.
pub fn validate_create(
    engine: &str,
    instances: &[InstanceDef],
    rules: &TopologyRules,
) -> Result<Vec<ServiceTypes>, ValidationError> {
    if instances.is_empty() {
        return Err(ValidationError::NoInstances);
    }
    if instances.len() < rules.min_nodes {
        return Err(ValidationError::TooFewNodes {
            engine: engine.to_string(),
            min: rules.min_nodes,
            got: instances.len(),
        });
    }
    check_homogeneous(instances)?;
    check_volumes(engine, instances, rules)?;
    compute_types(engine, instances, rules, false)
}

/// Check instances added to an existing cluster. New nodes must look like the
/// existing ones.
pub fn validate_grow(
    engine: &str,
    existing: &[NodeRecord],
    instances: &[InstanceDef],
    rules: &TopologyRules,
) -> Result<Vec<ServiceTypes>, ValidationError> {
    if instances.is_empty() {
        return Err(ValidationError::NoInstances);
    }
    check_volumes(engine, instances, rules)?;

    let existing: Vec<InstanceDef> = existing.iter().map(InstanceDef::from).collect();
    check_homogeneous(existing.iter().chain(instances))?;
    compute_types(engine, instances, rules, true)
}

/// Check that the cluster stays valid once `removal` has been taken out.
pub fn validate_shrink(
    engine: &str,
    existing: &[NodeRecord],
    removal: &[NodeId],
    rules: &TopologyRules,
) -> Result<(), ValidationError> {
    if removal.is_empty() {
        return Err(ValidationError::NoInstances);
    }
    if let Some(stranger) = removal
        .iter()
        .find(|id| !existing.iter().any(|node| node.id == **id))
    {
        return Err(ValidationError::NotAMember(*stranger));
    }

    let remaining: Vec<InstanceDef> = existing
        .iter()
        .filter(|node| !removal.contains(&node.id))
        .map(InstanceDef::from)
        .collect();

    if remaining.len() < rules.min_nodes.max(1) {
        return Err(ValidationError::TooFewNodes {
            engine: engine.to_string(),
            min: rules.min_nodes.max(1),
            got: remaining.len(),
        });
    }

    compute_types(engine, &remaining, rules, false).map(|_| ())
}
