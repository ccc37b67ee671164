//! Global 1-second ticker. Subsystems subscribe and spawn their own work on
//! each tick; the tick fan-out itself never blocks.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Ticker {
    tx: broadcast::Sender<DateTime<Utc>>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn(period: Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        let sender = tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // No receivers is fine; subscribers come and go
                let _ = sender.send(Utc::now());
            }
        });
        Self { tx, handle }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DateTime<Utc>> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
