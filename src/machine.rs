//! One discovered machine instance and the services connected to it.
//!
//! A [`Machine`] owns its services, its command sequencer, its job binding
//! and the tool change handshake.  It is driven entirely by the registry:
//! heartbeats reconcile the connected services against what discovery
//! advertises, dispatch feeds it the messages of its sockets.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::command::{Command, CommandBatch};
use crate::job::{
    FetchError, FetchRequest, JobBinding, JobCatalog, JobNotice, JobSynchronizer, SyncInputs,
};
use crate::motion;
use crate::mux::{Multiplexer, Owner, Ready};
use crate::notify::{Event, Notifier};
use crate::sequencer::{
    CommandSequence, CommandSink, SequenceError, SequenceHandle, SequenceId, SequenceState, Sequencer,
};
use crate::service::{self, Binding, Change, Service};
use crate::toolchange::{self, ToolChangeAction, ToolChangeMonitor, ToolChangePins};
use crate::transport::Transport;
use crate::tree::{StateView, TopicPath};
use crate::types::{Category, Endpoint, InstanceId};
use crate::wire;

/// Connected services keyed by category.  Doubles as the machine's view of
/// the mirrored state.
#[derive(Default)]
pub struct ServiceMap(BTreeMap<Category, Box<dyn Service>>);

impl ServiceMap {
    pub fn get(&self, category: Category) -> Option<&dyn Service> {
        self.0.get(&category).map(|s| &**s)
    }

    pub fn contains(&self, category: Category) -> bool {
        self.0.contains_key(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sink(&mut self, category: Category) -> Option<&mut dyn CommandSink> {
        self.0.get_mut(&category).and_then(|s| s.as_sink())
    }
}

impl StateView for ServiceMap {
    fn lookup(&self, path: &TopicPath) -> Option<&Value> {
        self.0.get(&path.category())?.lookup(path.segments())
    }
}

/// Timing shared by every machine.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub heartbeat: Duration,
    pub stale_after: Duration,
}

pub struct Machine {
    id: InstanceId,
    services: ServiceMap,
    sequencer: Sequencer,
    job: JobSynchronizer,
    tool_change: ToolChangeMonitor,
    last_heartbeat: Option<Instant>,
}

impl Machine {
    pub fn new(id: InstanceId, remote_filename: &str, fetch_retry: Duration) -> Self {
        info!("Tracking instance {}", id);
        Self {
            id,
            services: ServiceMap::default(),
            sequencer: Sequencer::new(),
            job: JobSynchronizer::new(remote_filename, fetch_retry),
            tool_change: ToolChangeMonitor::new(),
            last_heartbeat: None,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn state(&self) -> &ServiceMap {
        &self.services
    }

    /// The configured machine name, falling back to the instance id.
    pub fn name(&self) -> String {
        self.services
            .lookup(&TopicPath::status(["config", "name"]))
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn provides_services(&self, categories: &[Category]) -> bool {
        categories.iter().all(|c| self.services.contains(*c))
    }

    /// Status mirrored completely and a command service connected.
    pub fn is_valid(&self) -> bool {
        let status = match self.services.get(Category::Status) {
            Some(status) => status.is_valid(),
            None => false,
        };
        status && self.services.contains(Category::Command)
    }

    pub fn is_powered(&self) -> bool {
        self.is_valid() && motion::is_powered(&self.services)
    }

    pub fn is_homed(&self) -> bool {
        self.is_valid() && motion::is_homed(&self.services)
    }

    pub fn job(&self) -> Option<&JobBinding> {
        self.job.binding()
    }

    pub fn job_warning(&self) -> Option<&str> {
        self.job.warning()
    }

    pub fn sequence_state(&self) -> Option<(SequenceId, SequenceState)> {
        self.sequencer.active()
    }

    pub fn pending_tool_change(&self) -> Option<i64> {
        self.tool_change.pending()
    }

    /// Heartbeat work.  Does nothing when the previous heartbeat was less
    /// than `timing.heartbeat` ago.
    pub async fn heartbeat(
        &mut self,
        now: Instant,
        endpoints: &BTreeMap<Category, Endpoint>,
        transport: &dyn Transport,
        mux: &mut Multiplexer,
        notifier: &Notifier,
        timing: Timing,
    ) -> bool {
        if let Some(last) = self.last_heartbeat {
            if now.saturating_duration_since(last) < timing.heartbeat {
                return false;
            }
        }
        self.last_heartbeat = Some(now);

        self.reconcile(endpoints, transport, mux, notifier, timing.stale_after)
            .await;
        for service in self.services.0.values_mut() {
            service.ping(now).await;
        }
        self.sequencer.evaluate(&self.services);
        self.pump(notifier).await;
        true
    }

    /// Brings the connected services in line with `endpoints`.
    pub async fn reconcile(
        &mut self,
        endpoints: &BTreeMap<Category, Endpoint>,
        transport: &dyn Transport,
        mux: &mut Multiplexer,
        notifier: &Notifier,
        stale_after: Duration,
    ) {
        for category in Category::ALL.into_iter().filter(|c| c.has_handler()) {
            let current = self
                .services
                .0
                .get(&category)
                .map(|s| (s.signature().to_string(), s.is_connected()));
            match (endpoints.get(&category), current) {
                (None, Some(_)) => self.disconnect(category, mux, notifier),
                (Some(endpoint), Some((signature, connected)))
                    if signature != endpoint.signature || !connected =>
                {
                    if connected {
                        info!(
                            "{}: {} moved from {} to {}",
                            self.id, category, signature, endpoint.signature
                        );
                    } else {
                        info!("{}: {} connection lost, reconnecting", self.id, category);
                    }
                    self.disconnect(category, mux, notifier);
                    self.connect(category, endpoint, transport, mux, notifier, stale_after)
                        .await;
                }
                (Some(endpoint), None) => {
                    self.connect(category, endpoint, transport, mux, notifier, stale_after)
                        .await
                }
                _ => {}
            }
        }
    }

    async fn connect(
        &mut self,
        category: Category,
        endpoint: &Endpoint,
        transport: &dyn Transport,
        mux: &mut Multiplexer,
        notifier: &Notifier,
        stale_after: Duration,
    ) {
        let inbox = mux.allocate();
        let socket = inbox.socket();
        // Returns right away; the connection itself is made in the background.
        let link = match transport.open(endpoint, inbox).await {
            Ok(link) => link,
            Err(e) => {
                warn!("{}: connecting {} failed: {}", self.id, category, e);
                return;
            }
        };
        let binding = Binding {
            endpoint: endpoint.clone(),
            socket,
            link,
            stale_after,
        };
        let Some(mut service) = service::create(category, binding) else {
            return;
        };
        service.attach(&self.id);
        mux.register(
            socket,
            Owner {
                instance: self.id.clone(),
                category,
            },
        );
        self.services.0.insert(category, service);
        info!("{}: connected {} at {} ({})", self.id, category, endpoint, socket);
        notifier.publish(Event::ServiceAttached {
            instance: self.id.clone(),
            category,
        });
    }

    fn disconnect(&mut self, category: Category, mux: &mut Multiplexer, notifier: &Notifier) {
        let Some(mut service) = self.services.0.remove(&category) else {
            return;
        };
        mux.unregister(service.socket());
        let gone = service.detach();
        info!("{}: disconnected {}", self.id, category);
        self.publish_changes(category, gone, notifier);
        notifier.publish(Event::ServiceDetached {
            instance: self.id.clone(),
            category,
        });
    }

    /// Handles one message of one of this machine's sockets.
    pub async fn dispatch(&mut self, ready: Ready, now: Instant, notifier: &Notifier) {
        let category = ready.owner.category;
        let Some(service) = self.services.0.get_mut(&category) else {
            debug!("{}: no {} service for {}", self.id, category, ready.socket);
            return;
        };
        if service.socket() != ready.socket {
            debug!("{}: dropping message from replaced socket {}", self.id, ready.socket);
            return;
        }
        let container = match wire::decode(&ready.frames) {
            Ok(container) => container,
            Err(e) => {
                error!("{}: dropping {} message: {}", self.id, category, e);
                return;
            }
        };
        service.seen(now);
        if container.kind.is_keepalive() {
            return;
        }
        let changes = service.update(container);

        let tool_topic = format!("{}.{}", Category::HalStatus, toolchange::COMPONENT);
        let actions: Vec<ToolChangeAction> = changes
            .iter()
            .filter(|c| category == Category::HalStatus && c.topic == tool_topic)
            .filter_map(|c| c.value.as_ref())
            .filter_map(|v| self.tool_change.observe(ToolChangePins::from_value(v)))
            .collect();
        self.publish_changes(category, changes, notifier);

        for action in actions {
            self.handle_tool_change(action, notifier).await;
        }
    }

    fn publish_changes(&self, category: Category, changes: Vec<Change>, notifier: &Notifier) {
        for change in changes {
            notifier.publish(Event::TopicChanged {
                instance: self.id.clone(),
                category,
                topic: change.topic,
                value: change.value,
            });
        }
    }

    async fn handle_tool_change(&mut self, action: ToolChangeAction, notifier: &Notifier) {
        let result = match action {
            ToolChangeAction::Prompt(tool) => {
                info!("{}: insert tool #{}", self.name(), tool);
                notifier.publish(Event::ToolChangeRequested {
                    instance: self.id.clone(),
                    tool,
                });
                return;
            }
            ToolChangeAction::Acknowledge => {
                self.submit(Category::HalCommand, toolchange::set_changed(true))
                    .await
            }
            ToolChangeAction::Reset => {
                self.submit(Category::HalCommand, toolchange::set_changed(false))
                    .await
            }
        };
        if let Err(e) = result {
            warn!("{}: tool change {:?} not sent: {}", self.id, action, e);
        }
    }

    /// Answers an outstanding tool change: confirm once the tool is in, or
    /// abort the running program.
    pub async fn answer_tool_change(&mut self, confirm: bool) -> Result<(), SequenceError> {
        let tool = self.tool_change.answer();
        debug!("{}: tool change {:?} answered, confirm={}", self.id, tool, confirm);
        if confirm {
            self.submit(Category::HalCommand, toolchange::set_changed(true))
                .await
        } else {
            self.submit(Category::Command, Command::TaskAbort).await
        }
    }

    /// Writes a single command straight to a sink, outside any sequence.
    async fn submit(&mut self, category: Category, command: Command) -> Result<(), SequenceError> {
        let sink = self
            .services
            .sink(category)
            .ok_or(SequenceError::NoCommandService)?;
        sink.submit(&CommandBatch::single(command))
            .await
            .map_err(|e| SequenceError::Submit(e.to_string()))
    }

    /// Queues `sequence` and sends whatever is free to go right away.
    pub async fn start(
        &mut self,
        sequence: CommandSequence,
        notifier: &Notifier,
    ) -> Result<SequenceHandle, SequenceError> {
        if !self.services.contains(Category::Command) {
            return Err(SequenceError::NoCommandService);
        }
        let handle = self.sequencer.enqueue(sequence);
        self.pump(notifier).await;
        Ok(handle)
    }

    /// Stops every axis and drops all sequences.
    pub async fn abort(&mut self, notifier: &Notifier) -> Result<(), SequenceError> {
        let axes = motion::axis_count(&self.services);
        let sink = self.services.sink(Category::Command);
        let result = self.sequencer.abort(sink, axes).await;
        self.publish_finished(notifier);
        result
    }

    async fn pump(&mut self, notifier: &Notifier) {
        let sink = self.services.sink(Category::Command);
        if let Err(e) = self.sequencer.pump(sink).await {
            debug!("{}: sequence stopped: {}", self.id, e);
        }
        self.publish_finished(notifier);
    }

    fn publish_finished(&mut self, notifier: &Notifier) {
        for (sequence, state) in self.sequencer.take_finished() {
            notifier.publish(Event::SequenceFinished {
                instance: self.id.clone(),
                sequence,
                state,
            });
        }
    }

    fn job_inputs(&self, endpoints: &BTreeMap<Category, Endpoint>) -> SyncInputs {
        let text = |path: [&str; 2]| {
            self.services
                .lookup(&TopicPath::status(path))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        SyncInputs {
            loaded_file: text(["task", "file"]),
            remote_root: text(["config", "remote_path"]),
            endpoint: endpoints.get(&Category::File).cloned(),
        }
    }

    /// Runs the job check; returns the fetch to perform, if any.
    pub fn check_job(
        &mut self,
        endpoints: &BTreeMap<Category, Endpoint>,
        now: Instant,
        notifier: &Notifier,
    ) -> Option<FetchRequest> {
        let inputs = self.job_inputs(endpoints);
        let (request, notices) = self.job.check(inputs, now);
        self.publish_job(notices, notifier);
        request
    }

    pub fn complete_job(
        &mut self,
        request: &FetchRequest,
        result: Result<Vec<u8>, FetchError>,
        catalog: &dyn JobCatalog,
        notifier: &Notifier,
    ) {
        let notices = self.job.complete(request, result, catalog);
        self.publish_job(notices, notifier);
    }

    fn publish_job(&self, notices: Vec<JobNotice>, notifier: &Notifier) {
        for notice in notices {
            let event = match notice {
                JobNotice::Changed(job) => Event::JobChanged {
                    instance: self.id.clone(),
                    job,
                },
                JobNotice::OutOfDate { title, file_name } => Event::JobOutOfDate {
                    instance: self.id.clone(),
                    title,
                    file_name,
                },
            };
            notifier.publish(event);
        }
    }

    /// Aborts running sequences and disconnects every service.
    pub async fn shutdown(&mut self, mux: &mut Multiplexer, notifier: &Notifier) {
        if !self.sequencer.is_idle() {
            if let Err(e) = self.abort(notifier).await {
                warn!("{}: abort on shutdown failed: {}", self.id, e);
            }
        }
        let categories: Vec<Category> = self.services.categories().collect();
        for category in categories {
            self.disconnect(category, mux, notifier);
        }
        self.last_heartbeat = None;
    }
}
