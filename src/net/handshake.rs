//! Handshake driving.
//!
//! Every loop iteration asks each encrypted connection's engine what it
//! needs next and turns the answer into readiness interest, or hands the
//! engine's delegated work to a bounded set of task threads.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::Result;
use crate::net::channel::{Channel, ChannelId, ChannelKind};
use crate::net::crypto::{DelegatedTask, HandshakeStatus};
use crate::net::interest::{Ops, Selector};
use crate::net::network::Shared;

/// Runs delegated engine tasks on short-lived threads, at most `limit` at once.
#[derive(Debug)]
pub(crate) struct TaskRunner {
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

/// Releases a task slot and wakes the loop when a task thread ends.
struct TaskSlot {
    in_flight: Arc<AtomicUsize>,
    selector: Arc<Selector>,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.selector.wake();
    }
}

impl TaskRunner {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.limit
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn spawn(
        &self,
        channel: ChannelId,
        task: DelegatedTask,
        selector: Arc<Selector>,
    ) -> io::Result<()> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = TaskSlot {
            in_flight: self.in_flight.clone(),
            selector,
        };
        thread::Builder::new()
            .name(format!("netloop-task-{}", channel.as_usize()))
            .spawn(move || {
                let _slot = slot;
                task();
            })?;
        Ok(())
    }
}

/// Turn each engine's handshake status into interest or a delegated task.
///
/// Returns the status seen per encrypted channel.
pub(crate) fn process_handshakes(
    shared: &Shared,
    channels: &[Arc<Channel>],
    runner: &TaskRunner,
    selector: &Arc<Selector>,
) -> Result<Vec<(ChannelId, HandshakeStatus)>> {
    let mut statuses = Vec::new();

    for channel in channels.iter().filter(|c| c.kind == ChannelKind::Stream) {
        let status = {
            let mut engine = channel.engine.lock();
            let Some(engine) = engine.as_mut() else {
                continue;
            };
            let status = engine.handshake_status();
            if status == HandshakeStatus::NeedTask {
                while runner.has_capacity() {
                    let Some(task) = engine.delegated_task() else {
                        break;
                    };
                    if let Err(e) = runner.spawn(channel.id, task, selector.clone()) {
                        tracing::warn!(channel = %channel.id, error = %e, "Failed to spawn handshake task");
                        break;
                    }
                }
                if !runner.has_capacity() {
                    tracing::trace!(
                        channel = %channel.id,
                        in_flight = runner.in_flight(),
                        "Handshake task limit reached"
                    );
                }
            }
            status
        };
        statuses.push((channel.id, status));

        let requested = match status {
            HandshakeStatus::NeedWrap => shared.update_ops(channel, |ops| ops | Ops::WRITE),
            HandshakeStatus::NeedUnwrap => shared.update_ops(channel, |ops| ops | Ops::READ),
            HandshakeStatus::Finished => {
                tracing::debug!(channel = %channel.id, "TLS handshake completed");
                Ok(())
            }
            HandshakeStatus::NeedTask | HandshakeStatus::NotHandshaking => Ok(()),
        };
        match requested {
            Ok(()) => {}
            Err(e) if e.is_channel_scoped() => {
                tracing::warn!(channel = %channel.id, error = %e, "Handshake interest update failed");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Duration;

    use mio::net::TcpStream;
    use mio::Poll;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::error::CryptoError;
    use crate::net::crypto::{CryptoEngine, EngineResult, Status};

    use crate::net::crypto::HandshakeStatus::{Finished, NeedTask, NeedUnwrap, NeedWrap};

    /// Reports scripted handshake statuses and hands out queued tasks.
    struct ScriptedHandshake {
        statuses: VecDeque<HandshakeStatus>,
        tasks: VecDeque<DelegatedTask>,
    }

    impl CryptoEngine for ScriptedHandshake {
        fn unwrap(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
            Ok(EngineResult::new(Status::BufferUnderflow, 0, 0))
        }

        fn wrap(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
            Ok(EngineResult::new(Status::Ok, 0, 0))
        }

        fn handshake_status(&mut self) -> HandshakeStatus {
            self.statuses
                .pop_front()
                .unwrap_or(HandshakeStatus::NotHandshaking)
        }

        fn delegated_task(&mut self) -> Option<DelegatedTask> {
            self.tasks.pop_front()
        }

        fn close_inbound(&mut self) {}

        fn close_outbound(&mut self) {}
    }

    struct Fixture {
        _poll: Poll,
        selector: Arc<Selector>,
        shared: Shared,
        peer: std::net::TcpListener,
    }

    impl Fixture {
        fn new() -> Self {
            let poll = Poll::new().unwrap();
            let selector = Arc::new(Selector::new(&poll).unwrap());
            let shared = Shared::new(NetworkConfig::default());
            shared.open_with(selector.clone());
            Self {
                _poll: poll,
                selector,
                shared,
                peer: std::net::TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        fn stream(&self, engine: Option<Box<dyn CryptoEngine>>) -> Arc<Channel> {
            let stream = TcpStream::connect(self.peer.local_addr().unwrap()).unwrap();
            Arc::new(Channel::stream(ChannelId::next(), stream, engine, true))
        }

        fn scripted(
            &self,
            statuses: &[HandshakeStatus],
            tasks: Vec<DelegatedTask>,
        ) -> Arc<Channel> {
            self.stream(Some(Box::new(ScriptedHandshake {
                statuses: statuses.iter().copied().collect(),
                tasks: tasks.into(),
            })))
        }

        fn step(
            &self,
            channels: &[Arc<Channel>],
            runner: &TaskRunner,
        ) -> Vec<(ChannelId, HandshakeStatus)> {
            process_handshakes(&self.shared, channels, runner, &self.selector).unwrap()
        }
    }

    fn wait_idle(runner: &TaskRunner) {
        for _ in 0..500 {
            if runner.in_flight() == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("handshake tasks still running");
    }

    #[test]
    fn task_slots_are_released() {
        let poll = Poll::new().unwrap();
        let selector = Arc::new(Selector::new(&poll).unwrap());
        let runner = TaskRunner::new(1);
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        runner
            .spawn(
                ChannelId::from_raw(1),
                Box::new(move || {
                    release_rx.recv().unwrap();
                    tx.send(()).unwrap();
                }),
                selector,
            )
            .unwrap();
        assert!(!runner.has_capacity());

        release_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        wait_idle(&runner);
        assert!(runner.has_capacity());
    }

    #[test]
    fn wrap_and_unwrap_needs_become_interest() {
        let fixture = Fixture::new();
        let runner = TaskRunner::new(1);
        let encrypted = fixture.scripted(&[NeedUnwrap, NeedWrap, Finished], Vec::new());
        let plaintext = fixture.stream(None);
        let channels = vec![encrypted.clone(), plaintext.clone()];

        let statuses = fixture.step(&channels, &runner);
        assert_eq!(statuses, vec![(encrypted.id, NeedUnwrap)]);
        assert_eq!(encrypted.interest(), Ops::READ);

        fixture.step(&channels, &runner);
        assert_eq!(encrypted.interest(), Ops::READ | Ops::WRITE);

        let statuses = fixture.step(&channels, &runner);
        assert_eq!(statuses, vec![(encrypted.id, Finished)]);
        assert_eq!(encrypted.interest(), Ops::READ | Ops::WRITE);
        assert_eq!(plaintext.interest(), Ops::NONE);
    }

    #[test]
    fn delegated_tasks_respect_the_limit() {
        let fixture = Fixture::new();
        let runner = TaskRunner::new(2);
        let (done_tx, done_rx) = mpsc::channel();
        let mut releases = Vec::new();
        let mut tasks: Vec<DelegatedTask> = Vec::new();
        for i in 0..3 {
            let (release_tx, release_rx) = mpsc::channel::<()>();
            let done = done_tx.clone();
            releases.push(release_tx);
            tasks.push(Box::new(move || {
                let _ = release_rx.recv();
                done.send(i).unwrap();
            }));
        }
        let channel = fixture.scripted(&[NeedTask; 4], tasks);
        let channels = vec![channel.clone()];

        assert_eq!(fixture.step(&channels, &runner), vec![(channel.id, NeedTask)]);
        assert_eq!(runner.in_flight(), 2);
        assert_eq!(channel.interest(), Ops::NONE);

        drop(releases);
        let mut ran: Vec<i32> = (0..2)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        wait_idle(&runner);

        // The task left behind by the limit runs on the next pass.
        fixture.step(&channels, &runner);
        ran.push(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        ran.sort();
        assert_eq!(ran, [0, 1, 2]);
        wait_idle(&runner);

        // Nothing left to offer: no thread is started.
        fixture.step(&channels, &runner);
        assert_eq!(runner.in_flight(), 0);
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
