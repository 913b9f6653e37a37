//! Alert creation for vehicle owners.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    broadcast::FanOut,
    database::AlertStore,
    errors::TrackerError,
    models::{Alert, NewAlert, VehicleId},
};

/// Resolves a vehicle's owner, stores the alert and pushes it to the
/// owner's channel.
///
/// The dispatcher does not interpret alert content; severity and type are
/// chosen by the caller.
#[derive(Clone)]
pub struct AlertDispatcher {
    store: Arc<dyn AlertStore>,
    fanout: Arc<FanOut>,
}

impl AlertDispatcher {
    pub fn new(store: Arc<dyn AlertStore>, fanout: Arc<FanOut>) -> Self {
        Self { store, fanout }
    }

    /// Create an alert for the vehicle's owner.
    ///
    /// Returns `Ok(None)` when the vehicle has no owner; that case is logged,
    /// not treated as an error. Store failures are returned.
    pub async fn create_alert(
        &self,
        vehicle_id: &VehicleId,
        alert: NewAlert,
    ) -> Result<Option<Alert>, TrackerError> {
        let Some(user_id) = self.store.owner_of(vehicle_id).await? else {
            warn!(
                "No owner found for vehicle {}, dropping {} alert",
                vehicle_id, alert.kind
            );
            return Ok(None);
        };

        let alert = self.store.insert_alert(&user_id, vehicle_id, &alert).await?;
        info!(
            "Created {} alert {} for user {}",
            alert.kind, alert.id, alert.user_id
        );

        self.fanout.publish_alert(&alert).await;
        Ok(Some(alert))
    }
}
