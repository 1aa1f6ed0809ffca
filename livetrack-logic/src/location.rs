use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{UtcDT, geo::distance_km, prelude::*, settings::TrackingSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, specta::Type)]
/// A single position fix, either from the local [LocationSource] or received from a peer
pub struct LocationSample {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Horizontal accuracy radius, if the provider reported one
    pub accuracy_meters: Option<f64>,
    /// When this fix was captured (or received, for peer samples)
    pub captured_at: UtcDT,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64, accuracy_meters: Option<f64>) -> Self {
        Self {
            lat,
            lng,
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }

    /// Whether the coordinates are finite and within the valid lat/lng ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn distance_meters_to(&self, other: &LocationSample) -> f64 {
        distance_km(self.lat, self.lng, other.lat, other.lng) * 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, specta::Type)]
/// Where the restaurant for an order is, static for the lifetime of a session
pub struct RestaurantLocation {
    pub lat: f64,
    pub lng: f64,
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Something a [LocationSource] emits
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Sample(LocationSample),
    Error(String),
}

pub type SampleSink = mpsc::UnboundedSender<SourceEvent>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceOptions {
    /// Never emit faster than this
    pub min_interval: Duration,
    /// Fixes closer than this to the previously emitted one are skipped
    pub min_distance_meters: f64,
}

impl From<&TrackingSettings> for SourceOptions {
    fn from(settings: &TrackingSettings) -> Self {
        Self {
            min_interval: Duration::from_millis(settings.min_interval_ms.into()),
            min_distance_meters: settings.min_distance_meters,
        }
    }
}

/// A platform location provider that pushes samples in the background.
/// Callers must check [LocationSource::has_permission] and [LocationSource::is_enabled] before
/// calling [LocationSource::start]. Accuracy filtering is not done here.
pub trait LocationSource: Send + Sync {
    fn has_permission(&self) -> bool;
    fn is_enabled(&self) -> bool;
    /// Begin emitting [SourceEvent]s into `sink`, restarts the source if it's already running
    fn start(&self, options: SourceOptions, sink: SampleSink) -> Result;
    /// Stop emitting, safe to call when never started
    fn stop(&self);
}

/// A one-shot position provider, such as a platform geolocation API
pub trait PositionProvider: Send + Sync + 'static {
    fn current_position(&self) -> Result<LocationSample>;

    fn has_permission(&self) -> bool {
        true
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// [LocationSource] that polls a [PositionProvider] on an interval
pub struct PollingLocationSource<P: PositionProvider> {
    provider: Arc<P>,
    running: Mutex<Option<CancellationToken>>,
}

impl<P: PositionProvider> PollingLocationSource<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| !c.is_cancelled())
    }

    async fn poll_loop(
        provider: Arc<P>,
        options: SourceOptions,
        sink: SampleSink,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(options.min_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_emitted: Option<LocationSample> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                _ = interval.tick() => {}
            }

            let event = match provider.current_position() {
                Ok(sample) => {
                    let too_close = last_emitted.as_ref().is_some_and(|prev| {
                        prev.distance_meters_to(&sample) < options.min_distance_meters
                    });
                    if too_close {
                        continue;
                    }
                    last_emitted = Some(sample.clone());
                    SourceEvent::Sample(sample)
                }
                Err(why) => SourceEvent::Error(format!("Failed to get location: {why:#}")),
            };

            if sink.send(event).is_err() {
                // Nobody is listening anymore
                break;
            }
        }
    }
}

impl<P: PositionProvider> LocationSource for PollingLocationSource<P> {
    fn has_permission(&self) -> bool {
        self.provider.has_permission()
    }

    fn is_enabled(&self) -> bool {
        self.provider.is_enabled()
    }

    fn start(&self, options: SourceOptions, sink: SampleSink) -> Result {
        let handle = tokio::runtime::Handle::try_current()
            .context("No async runtime to schedule location polling on")?;

        let cancel = CancellationToken::new();
        let previous = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone());

        if let Some(previous) = previous {
            previous.cancel();
        }

        handle.spawn(Self::poll_loop(
            self.provider.clone(),
            options,
            sink,
            cancel,
        ));

        Ok(())
    }

    fn stop(&self) {
        if let Some(cancel) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}

impl<P: PositionProvider> Drop for PollingLocationSource<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
