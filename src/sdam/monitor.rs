use std::time::{Duration, Instant};

use super::{
    topology::{CheckRequests, TopologyUpdater, TopologyWatcher},
    ServerDescription,
    DEFAULT_HEARTBEAT_FREQUENCY,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// Weight given to the newest sample in the round trip time moving average.
const RTT_ALPHA: f64 = 0.2;

/// Checks one server with hello on a dedicated connection and reports what it finds.
///
/// Each server in the topology has its own monitor task. The task stops once the server is
/// removed from the topology or the topology is shut down.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_requests: CheckRequests,
    sdam_event_emitter: SdamEventEmitter,
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,

    /// Whether the server reported support for `hello` during the last check.
    hello_ok: Option<bool>,

    rtt: RttInfo,
    consecutive_failures: u32,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_requests: CheckRequests,
        connection_establisher: ConnectionEstablisher,
        sdam_event_emitter: SdamEventEmitter,
        client_options: &ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            topology_watcher,
            check_requests,
            sdam_event_emitter,
            heartbeat_frequency: client_options
                .heartbeat_freq
                .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            min_heartbeat_frequency: client_options.min_heartbeat_frequency(),
            hello_ok: None,
            rtt: RttInfo::default(),
            consecutive_failures: 0,
        };
        runtime::execute(monitor.execute());
    }

    async fn execute(mut self) {
        while self.is_alive() {
            self.check_requests.clear();
            let check_succeeded = self.check_server().await;

            // After a failure the server is checked again as soon as the minimum frequency
            // allows; otherwise the next check happens at the regular frequency or when one is
            // requested.
            let min_heartbeat_frequency = self.min_heartbeat_frequency;
            let remaining = self
                .heartbeat_frequency
                .saturating_sub(min_heartbeat_frequency);
            let check_requests = &mut self.check_requests;
            let wait = async move {
                runtime::delay_for(min_heartbeat_frequency).await;
                if check_succeeded {
                    check_requests.wait(remaining).await;
                }
            };

            tokio::select! {
                _ = wait => {}
                _ = self.topology_watcher.wait_until_removed(&self.address) => {}
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
            && self
                .topology_watcher
                .borrow_latest()
                .servers
                .contains_key(&self.address)
    }

    /// Checks the server by running a hello. A network error on a server that was previously
    /// available is retried once on a fresh connection before being reported. Both attempts
    /// make up one check, so they count as a single failure.
    ///
    /// Returns whether the check succeeded.
    async fn check_server(&mut self) -> bool {
        let mut check_result = self.perform_hello().await;

        if let Err(ref error) = check_result {
            let previously_available = self
                .topology_watcher
                .server_description(&self.address)
                .is_some_and(|sd| sd.is_available());
            if error.is_network_error() && previously_available {
                let error = error.clone();
                self.handle_error(error, self.consecutive_failures + 1)
                    .await;
                check_result = self.perform_hello().await;
            }
        }

        match check_result {
            Ok((reply, rtt)) => {
                self.consecutive_failures = 0;
                let average_rtt = self.rtt.add_sample(rtt);
                let server_description =
                    ServerDescription::new_from_hello_reply(self.address.clone(), reply, average_rtt);
                self.topology_updater.update(server_description).await;
                true
            }
            Err(error) => {
                self.consecutive_failures += 1;
                self.handle_error(error, self.consecutive_failures).await;
                false
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<(HelloReply, Duration)> {
        self.sdam_event_emitter.emit_event(|| {
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
            }
            .into()
        });

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => run_hello(conn, hello_command(self.hello_ok, None)).await,
            None => {
                match self
                    .connection_establisher
                    .establish_monitoring_connection(self.address.clone(), 0)
                    .await
                {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(reply) => {
                self.hello_ok = reply.command_response.hello_ok;
                self.sdam_event_emitter.emit_event(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                    })
                });
                Ok((reply, duration))
            }
            Err(error) => {
                self.connection = None;
                self.hello_ok = None;
                // the check this attempt belongs to is about to count as failed.
                let consecutive_failures = self.consecutive_failures + 1;
                self.sdam_event_emitter.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        consecutive_failures,
                        server_address: self.address.clone(),
                    })
                });
                Err(error)
            }
        }
    }

    async fn handle_error(&mut self, error: Error, consecutive_failures: u32) {
        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server = %self.address,
            consecutive_failures,
            "Marking server unknown after a failed check"
        );
        self.rtt.reset();
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error, consecutive_failures)
            .await;
    }
}

/// Exponentially weighted moving average of the round trip times observed by a monitor.
#[derive(Debug, Default)]
struct RttInfo {
    average: Option<Duration>,
}

impl RttInfo {
    /// Folds `sample` into the average and returns the new average.
    fn add_sample(&mut self, sample: Duration) -> Duration {
        let average = match self.average {
            Some(old) => Duration::from_secs_f64(
                RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * old.as_secs_f64(),
            ),
            None => sample,
        };
        self.average = Some(average);
        average
    }

    fn reset(&mut self) {
        self.average = None;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use approx::assert_relative_eq;

    use super::RttInfo;

    #[test]
    fn rtt_is_weighted_moving_average() {
        let mut rtt = RttInfo::default();
        assert_eq!(
            rtt.add_sample(Duration::from_millis(100)),
            Duration::from_millis(100)
        );

        let average = rtt.add_sample(Duration::from_millis(200));
        assert_relative_eq!(average.as_secs_f64(), 0.12, epsilon = 1e-9);

        let average = rtt.add_sample(Duration::from_millis(20));
        assert_relative_eq!(average.as_secs_f64(), 0.1, epsilon = 1e-9);

        rtt.reset();
        assert_eq!(
            rtt.add_sample(Duration::from_millis(7)),
            Duration::from_millis(7)
        );
    }
}
