//! Process-wide registry of machine instances.
//!
//! The registry owns every [`Machine`] and the shared [`Multiplexer`] behind
//! one lock.  A tick reconciles, pings and dispatches with the lock held.
//! Job fetches run in tasks of their own and their results are applied on a
//! later tick.  Callers on other tasks use the read and drive methods, which
//! take the same lock for the duration of the call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use crate::config::Config;
use crate::discovery::Directory;
use crate::job::{FetchError, FetchRequest, FileFetcher, JobBinding, JobCatalog};
use crate::machine::{Machine, Timing};
use crate::motion;
use crate::mux::Multiplexer;
use crate::notify::{Interest, Notifier, Subscription};
use crate::sequencer::{CommandSequence, SequenceError, SequenceHandle, SequenceId, SequenceState};
use crate::transport::Transport;
use crate::tree::{PathError, StateView, TopicPath};
use crate::types::{Category, InstanceId};

/// A program fetch that finished in the background.
struct Fetched {
    instance: InstanceId,
    request: FetchRequest,
    result: Result<Vec<u8>, FetchError>,
}

struct Table {
    machines: BTreeMap<InstanceId, Machine>,
    mux: Multiplexer,
    fetched: mpsc::UnboundedReceiver<Fetched>,
}

impl Table {
    fn new(fetched: mpsc::UnboundedReceiver<Fetched>) -> Self {
        Self {
            machines: BTreeMap::new(),
            mux: Multiplexer::new(),
            fetched,
        }
    }

    fn machine(&mut self, instance: &InstanceId) -> Result<&mut Machine, SequenceError> {
        self.machines
            .get_mut(instance)
            .ok_or_else(|| SequenceError::UnknownInstance(instance.clone()))
    }
}

pub struct Registry {
    config: Config,
    directory: Directory,
    transport: Box<dyn Transport>,
    fetcher: Arc<dyn FileFetcher>,
    catalog: Arc<dyn JobCatalog>,
    notifier: Notifier,
    table: Mutex<Table>,
    fetched_tx: mpsc::UnboundedSender<Fetched>,
    in_flight: Arc<AtomicUsize>,
    stop: watch::Sender<bool>,
}

impl Registry {
    pub fn new(
        config: Config,
        directory: Directory,
        transport: Box<dyn Transport>,
        fetcher: Arc<dyn FileFetcher>,
        catalog: Arc<dyn JobCatalog>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let (fetched_tx, fetched_rx) = mpsc::unbounded_channel();
        Self {
            config,
            directory,
            transport,
            fetcher,
            catalog,
            notifier: Notifier::new(),
            table: Mutex::new(Table::new(fetched_rx)),
            fetched_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            stop,
        }
    }

    pub fn subscribe(&self, interest: Interest) -> Subscription {
        self.notifier.subscribe(interest)
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn timing(&self) -> Timing {
        Timing {
            heartbeat: self.config.heartbeat(),
            stale_after: self.config.stale_after(),
        }
    }

    /// One pass of the bridge loop.
    pub async fn tick(&self, now: Instant) {
        let snapshot = self.directory.snapshot().await;
        let none = BTreeMap::new();

        let mut table = self.table.lock().await;
        if *self.stop.borrow() {
            return;
        }
        let Table {
            machines,
            mux,
            fetched,
        } = &mut *table;

        while let Ok(done) = fetched.try_recv() {
            if let Some(machine) = machines.get_mut(&done.instance) {
                machine.complete_job(&done.request, done.result, self.catalog.as_ref(), &self.notifier);
            }
        }

        for instance in snapshot.keys() {
            if !machines.contains_key(instance) {
                machines.insert(
                    instance.clone(),
                    Machine::new(
                        instance.clone(),
                        &self.config.remote_filename,
                        self.config.fetch_retry(),
                    ),
                );
            }
        }

        let timing = self.timing();
        for (instance, machine) in machines.iter_mut() {
            let endpoints = snapshot.get(instance).unwrap_or(&none);
            machine
                .heartbeat(now, endpoints, self.transport.as_ref(), mux, &self.notifier, timing)
                .await;
        }

        for ready in mux.poll(self.config.poll_timeout()).await {
            match machines.get_mut(&ready.owner.instance) {
                Some(machine) => machine.dispatch(ready, now, &self.notifier).await,
                None => debug!("No machine for {}", ready.owner.instance),
            }
        }

        for (instance, machine) in machines.iter_mut() {
            let endpoints = snapshot.get(instance).unwrap_or(&none);
            if let Some(request) = machine.check_job(endpoints, now, &self.notifier) {
                self.spawn_fetch(instance.clone(), request);
            }
        }
    }

    fn spawn_fetch(&self, instance: InstanceId, request: FetchRequest) {
        debug!("{}: fetching {} from {}", instance, request.name, request.endpoint);
        let fetcher = Arc::clone(&self.fetcher);
        let done = self.fetched_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = fetcher.fetch(&request.endpoint, &request.name).await;
            if done
                .send(Fetched {
                    instance,
                    request,
                    result,
                })
                .is_err()
            {
                debug!("Registry gone, dropping fetch result");
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Program fetches started but not finished yet.
    pub fn fetches_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ticks every poll interval until [`Registry::shutdown`].
    pub async fn run(&self) {
        let mut stop = self.stop.subscribe();
        info!(
            "Registry running (heartbeat {:?}, poll {:?})",
            self.config.heartbeat(),
            self.config.poll_interval()
        );
        while !*stop.borrow_and_update() {
            self.tick(Instant::now()).await;
            tokio::select! {
                _ = sleep(self.config.poll_interval()) => {}
                _ = stop.changed() => {}
            }
        }
        debug!("Registry loop stopped");
    }

    /// Stops the loop, aborts running sequences and disconnects every service.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let mut table = self.table.lock().await;
        let Table { machines, mux, .. } = &mut *table;
        for machine in machines.values_mut() {
            machine.shutdown(mux, &self.notifier).await;
        }
        info!("Registry shut down, {} socket(s) left", mux.registered());
    }

    pub async fn registered_sockets(&self) -> usize {
        self.table.lock().await.mux.registered()
    }

    /// Value at a dotted path such as `status.motion.axis.0.homed`.
    pub async fn get(&self, instance: &InstanceId, path: &str) -> Result<Option<Value>, PathError> {
        let path: TopicPath = path.parse()?;
        Ok(self.lookup(instance, &path).await)
    }

    pub async fn lookup(&self, instance: &InstanceId, path: &TopicPath) -> Option<Value> {
        let table = self.table.lock().await;
        table
            .machines
            .get(instance)
            .and_then(|m| m.state().lookup(path))
            .cloned()
    }

    /// Instances providing every category in `services`.
    pub async fn instances(&self, services: &[Category]) -> Vec<InstanceId> {
        let table = self.table.lock().await;
        table
            .machines
            .values()
            .filter(|m| m.provides_services(services))
            .map(|m| m.id().clone())
            .collect()
    }

    /// Some instance that can be driven.
    pub async fn any(&self) -> Option<InstanceId> {
        self.instances(&[Category::Command, Category::Status])
            .await
            .into_iter()
            .next()
    }

    async fn read<R>(&self, instance: &InstanceId, f: impl FnOnce(&Machine) -> R) -> Option<R> {
        let table = self.table.lock().await;
        table.machines.get(instance).map(f)
    }

    pub async fn provides_services(&self, instance: &InstanceId, services: &[Category]) -> bool {
        self.read(instance, |m| m.provides_services(services))
            .await
            .unwrap_or(false)
    }

    pub async fn is_valid(&self, instance: &InstanceId) -> bool {
        self.read(instance, Machine::is_valid).await.unwrap_or(false)
    }

    pub async fn is_powered(&self, instance: &InstanceId) -> bool {
        self.read(instance, Machine::is_powered).await.unwrap_or(false)
    }

    pub async fn is_homed(&self, instance: &InstanceId) -> bool {
        self.read(instance, Machine::is_homed).await.unwrap_or(false)
    }

    pub async fn name(&self, instance: &InstanceId) -> Option<String> {
        self.read(instance, Machine::name).await
    }

    pub async fn job(&self, instance: &InstanceId) -> Option<JobBinding> {
        self.read(instance, |m| m.job().cloned()).await.flatten()
    }

    pub async fn sequence_state(&self, instance: &InstanceId) -> Option<(SequenceId, SequenceState)> {
        self.read(instance, Machine::sequence_state).await.flatten()
    }

    pub async fn run_sequence(
        &self,
        instance: &InstanceId,
        sequence: CommandSequence,
    ) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        table.machine(instance)?.start(sequence, &self.notifier).await
    }

    /// Stops all axes of `instance` and drops its sequences.
    pub async fn abort(&self, instance: &InstanceId) -> Result<(), SequenceError> {
        let mut table = self.table.lock().await;
        table.machine(instance)?.abort(&self.notifier).await
    }

    pub async fn home(&self, instance: &InstanceId) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::home(machine.state())?;
        machine.start(sequence, &self.notifier).await
    }

    pub async fn power(&self, instance: &InstanceId) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::power(machine.state(), machine.is_powered());
        machine.start(sequence, &self.notifier).await
    }

    pub async fn mdi(&self, instance: &InstanceId, code: &str) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::mdi(machine.state(), code);
        machine.start(sequence, &self.notifier).await
    }

    pub async fn set_position(
        &self,
        instance: &InstanceId,
        positions: &[(char, f64)],
    ) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::set_position(machine.state(), positions)?;
        machine.start(sequence, &self.notifier).await
    }

    pub async fn jog(
        &self,
        instance: &InstanceId,
        axes: &str,
        distance: Option<f64>,
    ) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::jog(machine.state(), axes, distance)?;
        machine.start(sequence, &self.notifier).await
    }

    pub async fn jog_end(&self, instance: &InstanceId, axes: &str) -> Result<SequenceHandle, SequenceError> {
        let mut table = self.table.lock().await;
        let machine = table.machine(instance)?;
        let sequence = motion::jog_end(machine.state(), axes)?;
        machine.start(sequence, &self.notifier).await
    }

    /// Answers a pending tool change request.
    pub async fn confirm_tool_change(&self, instance: &InstanceId, confirm: bool) -> Result<(), SequenceError> {
        let mut table = self.table.lock().await;
        table.machine(instance)?.answer_tool_change(confirm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandBatch};
    use crate::job::{DocumentStore, FetchError, LocalDocument};
    use crate::notify::Event;
    use crate::sequencer::WaitGate;
    use crate::transport::MemoryTransport;
    use crate::types::{Endpoint, Update};
    use crate::wire::{self, Container, Frames, MessageType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeFetcher {
        content: std::sync::Mutex<Option<Vec<u8>>>,
        hang: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn serve(&self, content: Option<Vec<u8>>) {
            *self.content.lock().unwrap() = content;
        }
    }

    #[async_trait]
    impl FileFetcher for FakeFetcher {
        async fn fetch(&self, _endpoint: &Endpoint, _name: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.content
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| FetchError::Other("connection refused".into()))
        }
    }

    struct Rig {
        registry: Arc<Registry>,
        directory: Directory,
        transport: MemoryTransport,
        fetcher: Arc<FakeFetcher>,
        events: Subscription,
        start: Instant,
        ticks: u32,
    }

    fn mk() -> InstanceId {
        InstanceId::new("mk-1")
    }

    fn document() -> LocalDocument {
        LocalDocument::new(
            "Contour",
            "/parts/plate.FCStd",
            vec!["G0 X0 Y0".into(), "G1 X20 F300".into(), "M2".into()],
        )
    }

    impl Rig {
        fn new() -> Self {
            let config = Config {
                heartbeat_ms: 500,
                fetch_retry_ms: 500,
                ..Config::default()
            };
            let directory = Directory::new();
            let transport = MemoryTransport::new();
            let fetcher = Arc::new(FakeFetcher::default());
            let store = DocumentStore::new();
            store.register(document());
            let registry = Registry::new(
                config,
                directory.clone(),
                Box::new(transport.clone()),
                fetcher.clone(),
                Arc::new(store),
            );
            let events = registry.subscribe(Interest::all());
            Self {
                registry: Arc::new(registry),
                directory,
                transport,
                fetcher,
                events,
                start: Instant::now(),
                ticks: 0,
            }
        }

        async fn advertise(&self, service: &str, endpoint: Endpoint) {
            self.directory
                .apply(Update::Advertise {
                    instance: mk(),
                    service: service.to_string(),
                    endpoint,
                })
                .await;
        }

        async fn withdraw(&self, service: &str) {
            self.directory
                .apply(Update::Withdraw {
                    instance: mk(),
                    service: service.to_string(),
                })
                .await;
        }

        /// Ticks once, one heartbeat after the previous tick.
        async fn tick(&mut self) {
            let now = self.start + Duration::from_millis(500) * self.ticks;
            self.ticks += 1;
            self.registry.tick(now).await;
        }

        /// Waits for background fetches, then ticks so their results apply.
        async fn settle(&mut self) {
            for _ in 0..100 {
                if self.registry.fetches_in_flight() == 0 {
                    break;
                }
                sleep(Duration::from_millis(1)).await;
            }
            self.tick().await;
        }

        fn inject(&self, signature: &str, frames: Frames) {
            assert!(self.transport.inject(signature, frames));
        }

        fn drain(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Commands written to `signature`, keep-alives left out.  Each batch
        /// must arrive as exactly one payload frame.
        fn commands(&self, signature: &str) -> Vec<Value> {
            self.transport
                .sent_to(signature)
                .into_iter()
                .filter(|frames| !wire::decode(frames).unwrap().kind.is_keepalive())
                .flat_map(|frames| {
                    assert_eq!(frames.len(), 1);
                    CommandBatch::decode(&frames).unwrap().commands().to_vec()
                })
                .map(|command| serde_json::to_value(command).unwrap())
                .collect()
        }

        /// Status and command connected, every status topic mirrored.
        async fn connected(&mut self) {
            self.advertise("status", Endpoint::new("mk", 1)).await;
            self.advertise("command", Endpoint::new("mk", 2)).await;
            self.tick().await;
            self.inject(
                "mk:1",
                full(
                    "config",
                    json!({
                        "axes": 3,
                        "remote_path": "/nc",
                        "axis": [{"index": 0, "home_sequence": 0}]
                    }),
                ),
            );
            self.inject(
                "mk:1",
                full("motion", json!({"enabled": 1, "axis": [{"index": 0, "homed": 0}]})),
            );
            self.inject("mk:1", full("io", json!({"estop": 0})));
            self.inject("mk:1", full("task", json!({"task_mode": 1, "file": ""})));
            self.inject("mk:1", full("interp", json!({"state": 1})));
            self.tick().await;
            assert!(self.registry.is_valid(&mk()).await);
            self.drain();
        }
    }

    fn full(topic: &str, body: Value) -> Frames {
        Container::new(MessageType::FullUpdate)
            .with_topic(topic)
            .with_body(body)
            .to_frames()
            .unwrap()
    }

    fn incremental(topic: &str, body: Value) -> Frames {
        Container::new(MessageType::IncrementalUpdate)
            .with_topic(topic)
            .with_body(body)
            .to_frames()
            .unwrap()
    }

    fn exec(code: &str) -> Command {
        Command::TaskExecute {
            code: code.to_string(),
        }
    }

    fn topic_changes(events: &[Event]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::TopicChanged { topic, .. } => Some(topic.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sockets_track_advertised_handled_endpoints() {
        let mut rig = Rig::new();
        rig.advertise("status", Endpoint::new("mk", 1)).await;
        rig.advertise("command", Endpoint::new("mk", 2)).await;
        rig.advertise("file", Endpoint::new("mk", 3)).await;
        rig.advertise("preview", Endpoint::new("mk", 4)).await;
        rig.tick().await;
        assert_eq!(rig.registry.registered_sockets().await, 2);

        rig.advertise("error", Endpoint::new("mk", 5)).await;
        rig.tick().await;
        assert_eq!(rig.registry.registered_sockets().await, 3);

        rig.withdraw("command").await;
        rig.tick().await;
        assert_eq!(rig.registry.registered_sockets().await, 2);

        rig.directory.apply(Update::Vanish { instance: mk() }).await;
        rig.tick().await;
        assert_eq!(rig.registry.registered_sockets().await, 0);
        // The machine itself is kept.
        assert_eq!(rig.registry.instances(&[]).await, vec![mk()]);
    }

    #[tokio::test]
    async fn replaced_service_never_sees_old_messages() {
        let mut rig = Rig::new();
        rig.advertise("status", Endpoint::new("mk", 1)).await;
        rig.tick().await;
        rig.drain();

        rig.inject("mk:1", full("io", json!({"estop": 1})));
        rig.advertise("status", Endpoint::new("mk", 1).with_signature("v2"))
            .await;
        rig.tick().await;

        let events = rig.drain();
        assert_eq!(
            events,
            vec![
                Event::ServiceDetached {
                    instance: mk(),
                    category: Category::Status
                },
                Event::ServiceAttached {
                    instance: mk(),
                    category: Category::Status
                },
            ]
        );
        assert_eq!(rig.registry.get(&mk(), "status.io.estop").await.unwrap(), None);
        assert_eq!(rig.registry.registered_sockets().await, 1);
    }

    #[tokio::test]
    async fn pings_are_silent_and_updates_notify_once_per_topic() {
        let mut rig = Rig::new();
        rig.advertise("status", Endpoint::new("mk", 1)).await;
        rig.advertise("error", Endpoint::new("mk", 5)).await;
        rig.tick().await;
        rig.drain();

        rig.inject("mk:1", Container::ping().to_frames().unwrap());
        rig.inject("mk:5", Container::ping().to_frames().unwrap());
        rig.tick().await;
        assert!(rig.drain().is_empty());

        rig.inject("mk:1", full("motion", json!({"axis": [{"index": 0, "homed": 0}]})));
        rig.inject("mk:1", incremental("motion", json!({"axis": [{"index": 0, "homed": 1}]})));
        rig.inject(
            "mk:5",
            Container::new(MessageType::Error)
                .with_note("joint 0 following error")
                .to_frames()
                .unwrap(),
        );
        rig.tick().await;
        let events = rig.drain();
        assert_eq!(topic_changes(&events), vec!["status.motion", "status.motion", "error"]);
        assert_eq!(
            rig.registry
                .get(&mk(), "status.motion.axis.0.homed")
                .await
                .unwrap(),
            Some(json!(1))
        );
        assert!(rig.registry.get(&mk(), "status..axis").await.is_err());
    }

    #[tokio::test]
    async fn connectivity_flips_when_command_appears() {
        let mut rig = Rig::new();
        rig.advertise("status", Endpoint::new("mk", 1)).await;
        rig.tick().await;
        let driveable = [Category::Status, Category::Command];
        assert!(rig.registry.instances(&driveable).await.is_empty());
        assert_eq!(rig.registry.any().await, None);

        rig.advertise("command", Endpoint::new("mk", 2)).await;
        rig.tick().await;
        assert_eq!(rig.registry.instances(&driveable).await, vec![mk()]);
        assert!(rig.registry.provides_services(&mk(), &driveable).await);
        assert_eq!(rig.registry.any().await, Some(mk()));
    }

    #[tokio::test]
    async fn batches_are_written_in_order() {
        let mut rig = Rig::new();
        rig.connected().await;
        let sequence = CommandSequence::new()
            .batch(vec![exec("G0 X1")])
            .batch(vec![exec("G0 X2")])
            .batch(vec![exec("G0 X3")]);
        let handle = rig.registry.run_sequence(&mk(), sequence).await.unwrap();
        assert_eq!(handle.finished().await.unwrap(), SequenceState::Completed);
        let codes: Vec<Value> = rig.commands("mk:2").into_iter().map(|c| c["code"].clone()).collect();
        assert_eq!(codes, vec![json!("G0 X1"), json!("G0 X2"), json!("G0 X3")]);
        assert!(rig.drain().iter().any(|e| matches!(
            e,
            Event::SequenceFinished { state: SequenceState::Completed, .. }
        )));
    }

    #[tokio::test]
    async fn gate_holds_until_the_state_arrives() {
        let mut rig = Rig::new();
        rig.connected().await;
        let sequence = CommandSequence::new()
            .batch(vec![Command::AxisHome { axis: 0, home: true }])
            .wait(WaitGate::axis_homed(0))
            .batch(vec![exec("G10 L20 P0 X0")]);
        let handle = rig.registry.run_sequence(&mk(), sequence).await.unwrap();
        assert_eq!(rig.commands("mk:2").len(), 1);

        for _ in 0..3 {
            rig.tick().await;
            assert_eq!(rig.commands("mk:2").len(), 1);
            assert_eq!(
                rig.registry.sequence_state(&mk()).await.map(|(_, s)| s),
                Some(SequenceState::Waiting(1))
            );
        }

        rig.inject("mk:1", incremental("motion", json!({"axis": [{"index": 0, "homed": 1}]})));
        // Dispatched after this tick's gate check.
        rig.tick().await;
        assert_eq!(rig.commands("mk:2").len(), 1);
        rig.tick().await;
        assert_eq!(rig.commands("mk:2").len(), 2);
        assert_eq!(handle.finished().await.unwrap(), SequenceState::Completed);
    }

    #[tokio::test]
    async fn abort_stops_axes_and_later_batches() {
        let mut rig = Rig::new();
        rig.connected().await;
        let sequence = CommandSequence::new()
            .batch(vec![exec("G0 X50")])
            .wait(WaitGate::axis_homed(0))
            .batch(vec![exec("G0 X0")]);
        let handle = rig.registry.run_sequence(&mk(), sequence).await.unwrap();
        rig.registry.abort(&mk()).await.unwrap();

        rig.inject("mk:1", incremental("motion", json!({"axis": [{"index": 0, "homed": 1}]})));
        rig.tick().await;
        rig.tick().await;

        assert_eq!(
            rig.commands("mk:2"),
            vec![
                json!({"command": "task_execute", "code": "G0 X50"}),
                json!({"command": "axis_abort", "axis": 0}),
                json!({"command": "axis_abort", "axis": 1}),
                json!({"command": "axis_abort", "axis": 2}),
            ]
        );
        assert_eq!(handle.finished().await.unwrap(), SequenceState::Aborted);
        assert_eq!(rig.registry.sequence_state(&mk()).await, None);
    }

    #[tokio::test]
    async fn write_failure_is_reported_to_the_caller() {
        let mut rig = Rig::new();
        rig.connected().await;
        rig.transport.fail_sends_to("mk:2");
        let handle = rig.registry.mdi(&mk(), "G0 X1").await.unwrap();
        assert!(matches!(handle.finished().await, Err(SequenceError::Submit(_))));
        assert!(matches!(
            rig.registry.mdi(&InstanceId::new("ghost"), "G0").await,
            Err(SequenceError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn drive_surface_builds_sequences_from_state() {
        let mut rig = Rig::new();
        rig.connected().await;
        assert!(rig.registry.is_powered(&mk()).await);
        assert!(!rig.registry.is_homed(&mk()).await);

        rig.registry.power(&mk()).await.unwrap();
        assert_eq!(rig.commands("mk:2"), vec![json!({"command": "power", "on": false})]);
        rig.transport.clear_sent();

        let handle = rig.registry.home(&mk()).await.unwrap();
        assert_eq!(
            rig.commands("mk:2"),
            vec![json!({"command": "axis_home", "axis": 0, "home": true})]
        );
        assert_eq!(handle.state(), SequenceState::Waiting(1));
        rig.registry.abort(&mk()).await.unwrap();
        rig.transport.clear_sent();

        assert!(matches!(
            rig.registry.jog(&mk(), "X", Some(1.0)).await,
            Err(SequenceError::MissingState(_))
        ));
        rig.registry.jog_end(&mk(), "xY").await.unwrap();
        assert_eq!(
            rig.commands("mk:2"),
            vec![
                json!({"command": "axis_abort", "axis": 0}),
                json!({"command": "axis_abort", "axis": 1}),
            ]
        );
        assert_eq!(rig.registry.name(&mk()).await, Some("mk-1".to_string()));
    }

    async fn load_job(rig: &mut Rig) {
        rig.advertise("file", Endpoint::new("mk", 3)).await;
        rig.inject("mk:1", incremental("task", json!({"file": "/nc/mkbridge.ngc"})));
        rig.tick().await;
    }

    #[tokio::test]
    async fn matching_job_is_bound() {
        let mut rig = Rig::new();
        rig.connected().await;
        rig.fetcher.serve(Some(document().render().into_bytes()));
        load_job(&mut rig).await;
        rig.settle().await;

        assert_eq!(rig.registry.job(&mk()).await, Some(document().binding()));
        assert!(rig.drain().contains(&Event::JobChanged {
            instance: mk(),
            job: Some(document().binding())
        }));

        // Unchanged inputs: no refetch.
        rig.tick().await;
        assert_eq!(rig.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn out_of_date_job_is_not_bound() {
        let mut rig = Rig::new();
        rig.connected().await;
        let mut edited = document();
        edited.program.insert(1, "G0 Z5".into());
        rig.fetcher.serve(Some(edited.render().into_bytes()));
        load_job(&mut rig).await;
        rig.settle().await;

        assert_eq!(rig.registry.job(&mk()).await, None);
        assert!(rig.drain().contains(&Event::JobOutOfDate {
            instance: mk(),
            title: "Contour".into(),
            file_name: "/parts/plate.FCStd".into()
        }));
    }

    #[tokio::test]
    async fn failed_fetch_is_retried() {
        let mut rig = Rig::new();
        rig.connected().await;
        load_job(&mut rig).await;
        rig.settle().await;
        assert_eq!(rig.registry.job(&mk()).await, None);
        assert!(rig.fetcher.calls.load(Ordering::SeqCst) >= 1);

        rig.fetcher.serve(Some(document().render().into_bytes()));
        for _ in 0..5 {
            rig.settle().await;
            if rig.registry.job(&mk()).await.is_some() {
                break;
            }
        }
        assert_eq!(rig.registry.job(&mk()).await, Some(document().binding()));
        assert!(rig.fetcher.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn hanging_fetch_does_not_hold_up_the_loop() {
        let mut rig = Rig::new();
        rig.connected().await;
        rig.fetcher.hang.store(true, Ordering::SeqCst);
        load_job(&mut rig).await;
        assert_eq!(rig.registry.fetches_in_flight(), 1);

        rig.inject("mk:1", incremental("io", json!({"estop": 1})));
        tokio::time::timeout(Duration::from_secs(1), rig.tick())
            .await
            .unwrap();
        assert_eq!(
            rig.registry.get(&mk(), "status.io.estop").await.unwrap(),
            Some(json!(1))
        );
        tokio::time::timeout(Duration::from_secs(1), rig.registry.abort(&mk()))
            .await
            .unwrap()
            .unwrap();
        // Same inputs and no result yet: nothing else is fetched.
        rig.tick().await;
        assert_eq!(rig.registry.fetches_in_flight(), 1);
    }

    #[tokio::test]
    async fn tool_change_confirmation_reaches_the_machine() {
        let mut rig = Rig::new();
        rig.connected().await;
        rig.advertise("halrcomp", Endpoint::new("mk", 6)).await;
        rig.advertise("halrcmd", Endpoint::new("mk", 7)).await;
        rig.tick().await;

        rig.inject(
            "mk:6",
            full("fc_manualtoolchange", json!({"change": 1, "number": 2, "changed": 0})),
        );
        rig.tick().await;
        assert!(rig.drain().contains(&Event::ToolChangeRequested {
            instance: mk(),
            tool: 2
        }));

        rig.registry.confirm_tool_change(&mk(), true).await.unwrap();
        assert_eq!(
            rig.commands("mk:7"),
            vec![json!({"command": "hal_set_pin", "pin": "fc_manualtoolchange.changed", "value": true})]
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_and_releases_sockets() {
        let rig = Rig::new();
        rig.advertise("status", Endpoint::new("mk", 1)).await;
        rig.advertise("command", Endpoint::new("mk", 2)).await;

        let registry = Arc::clone(&rig.registry);
        let running = tokio::spawn(async move { registry.run().await });
        while rig.registry.registered_sockets().await < 2 {
            sleep(Duration::from_millis(5)).await;
        }

        rig.registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.registry.registered_sockets().await, 0);
        assert_eq!(rig.transport.closed(), 2);
    }
}
