//! Service lifecycle hooks around the monitor.
//!
//! `on_start` launches the loop and records it; `on_stop` joins the loop,
//! records the shutdown and tells the user protection has ended.
use crate::limiter::ResourceLimiter;
use crate::messages;
use crate::monitor::{ExitReason, Monitor};
use crate::process::ProcessControl;
use crate::sinks::{EventSink, NotificationSink};
use std::sync::Arc;

pub struct Service<P, L> {
    monitor: Monitor<P, L>,
    title: String,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn NotificationSink>,
}

impl<P, L> Service<P, L>
where
    P: ProcessControl + 'static,
    L: ResourceLimiter + 'static,
{
    pub fn new(
        monitor: Monitor<P, L>,
        title: impl Into<String>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            monitor,
            title: title.into(),
            events,
            notifier,
        }
    }

    pub fn on_start(&mut self) -> std::io::Result<()> {
        self.monitor.start()?;
        self.events.info(&messages::service_started());
        Ok(())
    }

    pub fn on_stop(&mut self) -> Option<ExitReason> {
        let reason = self.monitor.stop();
        self.events.info(&messages::service_stopped());
        self.notifier
            .show(&self.title, &messages::service_stopped_notice());
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetSpec, Timing};
    use crate::sinks::Severity;
    use crate::testing::{
        wait_until, Call, FakeLimiter, FakeProcesses, RecordingEvents, RecordingNotifier, MIB,
    };
    use std::time::Duration;

    fn service() -> (
        Service<FakeProcesses, FakeLimiter>,
        FakeProcesses,
        Arc<RecordingEvents>,
        Arc<RecordingNotifier>,
    ) {
        let procs = FakeProcesses::new("svc");
        procs.add(7, "svc", &[MIB]);
        let events = Arc::new(RecordingEvents::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = Monitor::new(
            TargetSpec::new("svc", "/opt/svc/svc", 100 * MIB).unwrap(),
            procs.clone(),
            FakeLimiter::default(),
            events.clone(),
            notifier.clone(),
        )
        .with_timing(Timing {
            poll_interval: Duration::from_millis(10),
            not_found_delay: Duration::from_millis(10),
        });
        let svc = Service::new(monitor, "svc", events.clone(), notifier.clone());
        (svc, procs, events, notifier)
    }

    #[test]
    fn test_start_then_stop_records_lifecycle() {
        let (mut svc, procs, events, notifier) = service();

        svc.on_start().unwrap();
        wait_until(|| procs.count(&Call::Read(7)) >= 1);
        let reason = svc.on_stop();

        assert!(matches!(reason, Some(ExitReason::Stopped)));
        let entries = events.entries();
        assert!(events.contains("Memory watchdog started"));
        assert_eq!(
            entries.last(),
            Some(&(Severity::Info, "Memory watchdog stopped".to_string()))
        );
        assert_eq!(
            notifier.shown(),
            vec![("svc".to_string(), messages::service_stopped_notice())]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_stop_from_single_threaded_runtime() {
        let (mut svc, procs, events, _notifier) = service();

        svc.on_start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while procs.count(&Call::Read(7)) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        // Joined inline on the runtime thread, without a blocking pool.
        assert!(matches!(svc.on_stop(), Some(ExitReason::Stopped)));
        assert!(events.contains("Memory watchdog stopped"));
    }

    #[test]
    fn test_stop_without_start_still_notifies() {
        let (mut svc, _procs, events, notifier) = service();
        assert!(svc.on_stop().is_none());
        assert!(events.contains("stopped"));
        assert_eq!(notifier.shown().len(), 1);
    }
}
