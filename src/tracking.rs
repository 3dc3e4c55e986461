//! Correlation engine.
//!
//! Joins each incoming fix to its vehicle, the vehicle's active duty
//! interval, and the route that interval serves, then publishes the joined
//! snapshot. Both feeds are last-value-wins broadcasts: a slow subscriber
//! only ever observes the most recent value, never a backlog.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::models::{GpsFix, TrackingSnapshot};
use crate::stores::{RouteStore, ScheduleStore, VehicleStore};

pub struct TrackingService {
    routes: Arc<RouteStore>,
    vehicles: Arc<VehicleStore>,
    schedules: Arc<ScheduleStore>,
    location_tx: watch::Sender<Option<TrackingSnapshot>>,
    raw_tx: watch::Sender<GpsFix>,
}

impl TrackingService {
    pub fn new(
        routes: Arc<RouteStore>,
        vehicles: Arc<VehicleStore>,
        schedules: Arc<ScheduleStore>,
    ) -> Self {
        let (location_tx, _) = watch::channel(None);
        let (raw_tx, _) = watch::channel(GpsFix::default());
        Self {
            routes,
            vehicles,
            schedules,
            location_tx,
            raw_tx,
        }
    }

    /// Live view of enriched tracking snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Option<TrackingSnapshot>> {
        self.location_tx.subscribe()
    }

    /// Live view of raw fixes, before correlation.
    pub fn subscribe_raw(&self) -> watch::Receiver<GpsFix> {
        self.raw_tx.subscribe()
    }

    /// Correlate one fix and publish the result. A fix that cannot be fully
    /// resolved is dropped with a warning; nothing partial is ever
    /// published.
    pub fn process_fix(&self, fix: GpsFix) {
        self.raw_tx.send_replace(fix.clone());

        let Ok(vehicle) = self.vehicles.get(&fix.uid) else {
            warn!(uid = %fix.uid, "no vehicle known for tracker uid");
            return;
        };
        let Ok(schedule) = self.schedules.current_for(&vehicle.state_number, fix.time) else {
            warn!(
                state_number = %vehicle.state_number,
                gps_time = %fix.time,
                "no active schedule for vehicle"
            );
            return;
        };
        let Ok(route) = self.routes.get(&schedule.route_number) else {
            warn!(route_number = %schedule.route_number, "no route for schedule entry");
            return;
        };

        self.location_tx.send_replace(Some(TrackingSnapshot {
            route,
            vehicle,
            location: fix,
            schedule,
        }));
    }
}
