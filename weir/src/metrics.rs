// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker counters.

use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::interval;

use crate::commands::DispatcherToMetricsCmd;

/// Collects counters from the dispatcher and logs them periodically.
///
/// Queue-overflow and delivery-failure drops are counted here, so operational
/// tooling can observe them without a dashboard.
#[derive(Debug)]
pub struct Metrics {
    sys_interval: u64,

    dispatcher_receiver: Receiver<DispatcherToMetricsCmd>,

    sessions: u64,
    subscriptions: u64,

    retained_count: u64,
    retained_bytes: u64,

    publish_sent_count: u64,
    publish_sent_bytes: u64,
    publish_received_count: u64,
    publish_received_bytes: u64,
    publish_dropped_count: u64,
    publish_dropped_bytes: u64,
}

impl Metrics {
    #[must_use]
    pub fn new(sys_interval: u64, dispatcher_receiver: Receiver<DispatcherToMetricsCmd>) -> Self {
        Self {
            sys_interval,

            dispatcher_receiver,

            sessions: 0,
            subscriptions: 0,

            retained_count: 0,
            retained_bytes: 0,

            publish_sent_count: 0,
            publish_sent_bytes: 0,
            publish_received_count: 0,
            publish_received_bytes: 0,
            publish_dropped_count: 0,
            publish_dropped_bytes: 0,
        }
    }

    pub async fn run_loop(&mut self) -> ! {
        // A zero interval disables periodic counter logs but the counters are
        // still maintained.
        let tick_interval = if self.sys_interval == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_secs(self.sys_interval)
        };
        let mut sys_tick = interval(tick_interval);

        loop {
            tokio::select! {
                Some(cmd) = self.dispatcher_receiver.recv() => {
                    self.handle_dispatcher_cmd(&cmd);
                },
                _ = sys_tick.tick() => {
                    if self.sys_interval > 0 {
                        self.log_counters();
                    }
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn handle_dispatcher_cmd(&mut self, cmd: &DispatcherToMetricsCmd) {
        match cmd {
            DispatcherToMetricsCmd::SessionAdded => self.sessions += 1,
            DispatcherToMetricsCmd::SessionRemoved => {
                self.sessions = self.sessions.saturating_sub(1);
            }
            DispatcherToMetricsCmd::SubscriptionsAdded(count) => {
                self.subscriptions += *count as u64;
            }
            DispatcherToMetricsCmd::SubscriptionsRemoved(count) => {
                self.subscriptions = self.subscriptions.saturating_sub(*count as u64);
            }
            DispatcherToMetricsCmd::RetainedMessageAdded(count, bytes) => {
                self.retained_count += *count as u64;
                self.retained_bytes += *bytes as u64;
            }
            DispatcherToMetricsCmd::RetainedMessageRemoved(count, bytes) => {
                self.retained_count = self.retained_count.saturating_sub(*count as u64);
                self.retained_bytes = self.retained_bytes.saturating_sub(*bytes as u64);
            }
            DispatcherToMetricsCmd::PublishPacketSent(count, bytes) => {
                self.publish_sent_count += *count as u64;
                self.publish_sent_bytes += *bytes as u64;
            }
            DispatcherToMetricsCmd::PublishPacketReceived(count, bytes) => {
                self.publish_received_count += *count as u64;
                self.publish_received_bytes += *bytes as u64;
            }
            DispatcherToMetricsCmd::PublishPacketDropped(count, bytes) => {
                self.publish_dropped_count += *count as u64;
                self.publish_dropped_bytes += *bytes as u64;
            }
        }
    }

    fn log_counters(&self) {
        log::info!(
            "metrics: sessions={}, subscriptions={}, retained={} ({} bytes), \
             publish sent={} ({} bytes), received={} ({} bytes), dropped={} ({} bytes)",
            self.sessions,
            self.subscriptions,
            self.retained_count,
            self.retained_bytes,
            self.publish_sent_count,
            self.publish_sent_bytes,
            self.publish_received_count,
            self.publish_received_bytes,
            self.publish_dropped_count,
            self.publish_dropped_bytes,
        );
    }
}
