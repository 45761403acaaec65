//! Read API over the aggregation state and the durable store
//!
//! Unbounded reading queries are answered from the in-memory ring; any time
//! bound sends the query to the durable store.

use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::QueryError;
use crate::models::{ClientStatus, DeviceStats, DeviceStatus, Reading};
use crate::state::AggregationState;
use crate::storage::DurableStore;
use crate::validation::sanitize_device_key;

/// Parse an optional RFC 3339 time bound; blank text means unbounded
pub fn parse_time_bound(text: Option<&str>) -> Result<Option<OffsetDateTime>, QueryError> {
    match text.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => OffsetDateTime::parse(text, &Rfc3339)
            .map(Some)
            .map_err(|_| QueryError::InvalidTimeBound(text.to_string())),
    }
}

#[derive(Clone)]
pub struct QueryFacade {
    state: Arc<AggregationState>,
    store: Arc<dyn DurableStore>,
}

impl QueryFacade {
    pub fn new(state: Arc<AggregationState>, store: Arc<dyn DurableStore>) -> Self {
        Self { state, store }
    }

    pub fn get_devices(&self) -> Vec<DeviceStatus> {
        self.state.device_statuses()
    }

    pub fn get_clients(&self) -> Vec<ClientStatus> {
        self.state.client_statuses()
    }

    /// Statistics over the device's ring, None for an unknown device
    pub fn get_stats(&self, device_key: &str) -> Result<Option<DeviceStats>, QueryError> {
        let key = device_key_of(device_key)?;
        Ok(self.state.stats(&key))
    }

    pub async fn get_readings(
        &self,
        device_key: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, QueryError> {
        let key = device_key_of(device_key)?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(QueryError::ReversedRange);
            }
        }

        if from.is_none() && to.is_none() {
            return Ok(self.state.recent_readings(&key).unwrap_or_default());
        }
        Ok(self.store.load(&key, from, to).await?)
    }

    /// [`QueryFacade::get_readings`] with RFC 3339 text bounds
    pub async fn get_readings_text(
        &self,
        device_key: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<Reading>, QueryError> {
        let from = parse_time_bound(from)?;
        let to = parse_time_bound(to)?;
        self.get_readings(device_key, from, to).await
    }
}

fn device_key_of(raw: &str) -> Result<String, QueryError> {
    sanitize_device_key(raw).ok_or_else(|| QueryError::InvalidDeviceKey(raw.to_string()))
}
