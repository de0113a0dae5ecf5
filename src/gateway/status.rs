//! Status feedback for Gateway-API resources.
//!
//! Every update runs under optimistic-concurrency retry: fetch the latest
//! status, merge with entries authored by other controllers, skip when the
//! diff is empty, and retry on conflict.

use super::client::{GatewayClient, RouteKind, StatusError};
use super::resources::{
    Condition, GatewayStatus, ListenerStatus, RouteParentStatus, RouteStatus, CONTROLLER_NAME,
};
use tracing::warn;

const MAX_CONFLICT_RETRIES: usize = 5;

/// Conditions compared by Type/Reason/Status/Message/ObservedGeneration.
pub fn conditions_equal(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(ca, cb)| {
            ca.condition_type == cb.condition_type
                && ca.reason == cb.reason
                && ca.status == cb.status
                && ca.message == cb.message
                && ca.observed_generation == cb.observed_generation
        })
}

fn route_parent_status_equal(a: &RouteParentStatus, b: &RouteParentStatus) -> bool {
    a.parent_ref == b.parent_ref
        && a.controller_name == b.controller_name
        && conditions_equal(&a.conditions, &b.conditions)
}

/// Parent statuses compared as unordered sets.
pub fn route_parent_statuses_equal(a: &[RouteParentStatus], b: &[RouteParentStatus]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter()
        .all(|sa| b.iter().any(|sb| route_parent_status_equal(sa, sb)))
        && b.iter()
            .all(|sb| a.iter().any(|sa| route_parent_status_equal(sa, sb)))
}

/// Gateway listener statuses compared by name, conditions and
/// AttachedRoutes.
pub fn gateway_status_equal(a: &GatewayStatus, b: &GatewayStatus) -> bool {
    if a.listeners.len() != b.listeners.len() {
        return false;
    }
    if !conditions_equal(&a.conditions, &b.conditions) {
        return false;
    }

    let mut listener_matches = 0;
    for new_listener in &b.listeners {
        for old_listener in &a.listeners {
            if new_listener.name == old_listener.name {
                if !conditions_equal(&new_listener.conditions, &old_listener.conditions) {
                    return false;
                }
                if new_listener.attached_routes != old_listener.attached_routes {
                    return false;
                }
                listener_matches += 1;
            }
        }
    }

    listener_matches == a.listeners.len()
}

/// Merge our parent statuses with the current ones, preserving entries
/// authored by other controllers verbatim.
pub fn merge_parent_statuses(
    current: &[RouteParentStatus],
    ours: Vec<RouteParentStatus>,
) -> Vec<RouteParentStatus> {
    let mut merged = ours;
    for status in current {
        if status.controller_name != CONTROLLER_NAME {
            merged.push(status.clone());
        }
    }
    merged
}

/// Write a route status under retry-on-conflict; updates are suppressed
/// when nothing changed.
pub async fn write_route_status(
    client: &dyn GatewayClient,
    kind: RouteKind,
    namespace: &str,
    name: &str,
    parents: Vec<RouteParentStatus>,
) {
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some((version, current)) = client.get_route_status(kind, namespace, name) else {
            warn!(kind = %kind, namespace, name, "Unable to fetch status");
            return;
        };

        let merged = merge_parent_statuses(&current.parents, parents.clone());
        if route_parent_statuses_equal(&current.parents, &merged) {
            return;
        }

        match client
            .update_route_status(kind, namespace, name, version, RouteStatus { parents: merged })
            .await
        {
            Ok(()) => return,
            Err(StatusError::Conflict) => continue,
            Err(e) => {
                warn!(kind = %kind, namespace, name, "Unable to update status: {}", e);
                return;
            }
        }
    }

    warn!(kind = %kind, namespace, name, "Status update still conflicting after retries");
}

/// Write a gateway status under the same retry discipline.
pub async fn write_gateway_status(
    client: &dyn GatewayClient,
    namespace: &str,
    name: &str,
    conditions: Vec<Condition>,
    listeners: Vec<ListenerStatus>,
) {
    let status = GatewayStatus {
        conditions,
        listeners,
    };

    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some((version, current)) = client.get_gateway_status(namespace, name) else {
            warn!(namespace, name, "Unable to fetch Gateway status");
            return;
        };

        if gateway_status_equal(&current, &status) {
            return;
        }

        match client
            .update_gateway_status(namespace, name, version, status.clone())
            .await
        {
            Ok(()) => return,
            Err(StatusError::Conflict) => continue,
            Err(e) => {
                warn!(namespace, name, "Unable to update Gateway status: {}", e);
                return;
            }
        }
    }

    warn!(namespace, name, "Gateway status update still conflicting after retries");
}
