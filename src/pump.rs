use crate::client::Client;
use crate::host::{StatusSink, WorldHost};
use crate::server::Server;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Extra immediate ticks allowed in one pump step while events keep arriving.
pub const DEFAULT_MAX_CATCH_UP: usize = 8;

pub trait Pumpable {
    fn pump_tick(&mut self, now: Instant) -> usize;
    fn has_pending_events(&self) -> bool;
}

impl<T: Transport, H: WorldHost, S: StatusSink> Pumpable for Server<T, H, S> {
    fn pump_tick(&mut self, now: Instant) -> usize {
        self.tick(now)
    }

    fn has_pending_events(&self) -> bool {
        Server::has_pending_events(self)
    }
}

impl<T: Transport, H: WorldHost, S: StatusSink> Pumpable for Client<T, H, S> {
    fn pump_tick(&mut self, now: Instant) -> usize {
        self.tick(now)
    }

    fn has_pending_events(&self) -> bool {
        Client::has_pending_events(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventPump {
    interval: Duration,
    max_catch_up: usize,
}

impl Default for EventPump {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl EventPump {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_catch_up: DEFAULT_MAX_CATCH_UP,
        }
    }

    pub fn with_max_catch_up(mut self, ticks: usize) -> Self {
        self.max_catch_up = ticks;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One tick plus catch-up ticks while events are pending. Returns the
    /// number of events handled.
    pub fn step<P: Pumpable>(&self, target: &mut P) -> usize {
        let mut handled = target.pump_tick(Instant::now());
        let mut extra = 0;
        while extra < self.max_catch_up && target.has_pending_events() {
            handled += target.pump_tick(Instant::now());
            extra += 1;
        }
        handled
    }

    /// Blocks the calling thread, stepping until `stop` is set.
    pub fn run_until<P: Pumpable>(&self, target: &mut P, stop: &AtomicBool) {
        tracing::debug!("Event pump started ({:?} interval)", self.interval);
        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            self.step(target);

            if !target.has_pending_events() {
                let elapsed = started.elapsed();
                if elapsed < self.interval {
                    std::thread::sleep(self.interval - elapsed);
                }
            }
        }
        tracing::debug!("Event pump stopped");
    }

    /// Steps on a tokio interval until `shutdown` turns true or its sender
    /// is dropped.
    #[cfg(feature = "async")]
    pub async fn run_async<P: Pumpable>(&self, target: &mut P, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!("Async event pump started ({:?} interval)", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.step(target);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Async event pump stopped");
    }
}
