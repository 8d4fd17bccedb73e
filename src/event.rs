use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::net::{FetchRequest, Transport};

/// Connectivity events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// The origin stopped answering
  ConnectivityLost,
  /// The origin answers again after an outage
  ConnectivityRestored,
  /// Background sync requested for a tag
  Sync(String),
  /// Probe finished with no change
  Tick,
}

/// Probes whether the API origin is reachable.
pub struct ConnectivityMonitor<T: Transport> {
  transport: Arc<T>,
  probe_url: Url,
}

impl<T: Transport> ConnectivityMonitor<T> {
  pub fn new(transport: Arc<T>, probe_url: Url) -> Self {
    Self {
      transport,
      probe_url,
    }
  }

  /// Any HTTP response counts as online, whatever its status.
  pub async fn is_online(&self) -> bool {
    let request = FetchRequest::new(reqwest::Method::HEAD, self.probe_url.clone());
    match self.transport.send(&request).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Connectivity probe failed");
        false
      }
    }
  }
}

/// Events implied by moving from `previous` to `online`.
///
/// Coming up (at start or after an outage) requests a sync so results
/// queued while offline go out.
fn transition(previous: Option<bool>, online: bool, sync_tag: &str) -> Vec<Event> {
  match (previous, online) {
    (Some(false), true) => vec![
      Event::ConnectivityRestored,
      Event::Sync(sync_tag.to_string()),
    ],
    (None, true) => vec![Event::Sync(sync_tag.to_string())],
    (Some(true), false) | (None, false) => vec![Event::ConnectivityLost],
    _ => vec![Event::Tick],
  }
}

/// Event handler that turns periodic connectivity probes into events
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Start probing every `tick_rate`
  pub fn new<T: Transport>(
    monitor: ConnectivityMonitor<T>,
    tick_rate: Duration,
    sync_tag: String,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      let mut online = None;
      loop {
        interval.tick().await;
        let now = monitor.is_online().await;
        if online != Some(now) {
          info!(online = now, "Connectivity changed");
        }
        for event in transition(online, now, &sync_tag) {
          if tx.send(event).is_err() {
            return;
          }
        }
        online = Some(now);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
