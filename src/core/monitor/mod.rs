mod debounce;
mod signatures;

pub use debounce::Debouncer;
pub use signatures::SignatureSet;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::alerts::{Alert, AlertDispatcher, AlertKind};
use crate::core::bot::BotId;
use crate::core::config::MonitorConfig;
use crate::core::error::SupervisorResult;
use crate::core::logs::{self, LogOffsets, LogPaths, LogStream, LogTail};
use crate::core::process::BotEvent;
use crate::core::registry::BotRegistry;

struct Shared {
    registry: Arc<BotRegistry>,
    dispatcher: AlertDispatcher,
    signatures: SignatureSet,
    debouncer: std::sync::Mutex<Debouncer>,
    poll: Duration,
    streams: Vec<LogStream>,
    excerpt_lines: usize,
}

/// Where a retired scanner's final drain must stop. Unset means end of file.
type DrainBound = Arc<std::sync::Mutex<Option<LogOffsets>>>;

/// Scanner tasks for one bot's streams.
struct Watch {
    stop: CancellationToken,
    bound: DrainBound,
    tasks: Vec<JoinHandle<()>>,
}

impl Watch {
    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cap the final drain at `offsets` unless a bound is already known.
    fn bound_at(&self, offsets: LogOffsets) {
        let mut bound = self
            .bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if bound.is_none() {
            *bound = Some(offsets);
        }
    }

    /// Cancel and wait for the final drain of every scanner.
    async fn retire(self) {
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Watches captured output of running bots and raises error-log alerts.
///
/// Learns about starts and exits from the controller's event channel. It only
/// reads log files and never touches process state.
pub struct ErrorMonitor {
    shared: Arc<Shared>,
    events: broadcast::Receiver<BotEvent>,
}

impl ErrorMonitor {
    pub fn new(
        registry: Arc<BotRegistry>,
        dispatcher: AlertDispatcher,
        config: &MonitorConfig,
        events: broadcast::Receiver<BotEvent>,
    ) -> SupervisorResult<Self> {
        let signatures = SignatureSet::new(&config.signatures)?;
        if signatures.is_empty() {
            warn!("No error signatures configured; log monitoring is inert");
        }
        let mut streams = vec![LogStream::Stderr];
        if config.scan_stdout {
            streams.push(LogStream::Stdout);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                dispatcher,
                signatures,
                debouncer: std::sync::Mutex::new(Debouncer::new(config.debounce())),
                poll: config.poll_interval(),
                streams,
                excerpt_lines: config.excerpt_lines.max(1),
            }),
            events,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let ErrorMonitor { shared, mut events } = self;
        let mut watches: HashMap<BotId, Watch> = HashMap::new();
        shared.resync(&mut watches).await;
        info!("Error monitor watching {} bot(s)", watches.len());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(BotEvent::Started { id, name, paths, offsets }) => {
                        if let Some(old) = watches.remove(&id) {
                            // The new run's output belongs to the new watch.
                            old.bound_at(offsets);
                            old.retire().await;
                        }
                        let offsets = [
                            (LogStream::Stdout, offsets.stdout),
                            (LogStream::Stderr, offsets.stderr),
                        ];
                        let watch = shared.watch(id, name, &paths, &offsets).await;
                        watches.insert(id, watch);
                    }
                    Ok(BotEvent::Exited { id, ends }) => {
                        if let Some(watch) = watches.get(&id) {
                            if let Some(ends) = ends {
                                watch.bound_at(ends);
                            }
                            watch.stop.cancel();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Error monitor missed {} lifecycle events, resyncing", missed);
                        shared.resync(&mut watches).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        for (_, watch) in watches.drain() {
            watch.retire().await;
        }
        debug!("Error monitor stopped");
    }
}

impl Shared {
    async fn watch(
        self: &Arc<Self>,
        id: BotId,
        name: String,
        paths: &LogPaths,
        offsets: &[(LogStream, u64)],
    ) -> Watch {
        let stop = CancellationToken::new();
        let bound = DrainBound::default();
        let mut tasks = Vec::new();
        for &(stream, offset) in offsets {
            if !self.streams.contains(&stream) {
                continue;
            }
            if let Err(e) = self.registry.save_offset(id, stream, offset).await {
                warn!("Could not persist {} offset for {}: {}", stream.as_str(), name, e);
            }
            tasks.push(tokio::spawn(self.clone().scan_stream(
                id,
                name.clone(),
                stream,
                paths.get(stream).to_path_buf(),
                offset,
                stop.clone(),
                bound.clone(),
            )));
        }
        debug!("Watching logs of {} from {:?}", name, offsets);
        Watch { stop, bound, tasks }
    }

    /// Align watches with the registry: every live bot is watched from its
    /// stored offset, everything else is retired.
    async fn resync(self: &Arc<Self>, watches: &mut HashMap<BotId, Watch>) {
        let bots = match self.registry.list().await {
            Ok(bots) => bots,
            Err(e) => {
                warn!("Error monitor could not list bots: {}", e);
                return;
            }
        };

        let stale: Vec<BotId> = watches
            .iter()
            .filter(|(id, watch)| {
                watch.is_stopping() || !bots.iter().any(|b| b.id == **id && b.status.is_live())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(watch) = watches.remove(&id) {
                watch.retire().await;
            }
        }

        for bot in bots.into_iter().filter(|b| b.status.is_live()) {
            if watches.contains_key(&bot.id) {
                continue;
            }
            let paths = bot.log_paths();
            let mut offsets = Vec::new();
            for stream in [LogStream::Stdout, LogStream::Stderr] {
                let stored = self.registry.load_offset(bot.id, stream).await.ok().flatten();
                let offset = match stored {
                    Some(offset) => offset,
                    None => logs::current_len(paths.get(stream)).unwrap_or(0),
                };
                offsets.push((stream, offset));
            }
            let watch = self.watch(bot.id, bot.name, &paths, &offsets).await;
            watches.insert(bot.id, watch);
        }
    }

    async fn scan_stream(
        self: Arc<Self>,
        id: BotId,
        name: String,
        stream: LogStream,
        path: PathBuf,
        offset: u64,
        stop: CancellationToken,
        bound: DrainBound,
    ) {
        let mut tail = LogTail::from_offset(path, offset);
        let mut missing = false;
        loop {
            let last = tokio::select! {
                _ = stop.cancelled() => true,
                _ = tokio::time::sleep(self.poll) => false,
            };
            if last {
                // Final drain: whatever the process wrote before exiting, and
                // nothing a later run appended.
                let end = bound
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .map(|offsets| offsets.get(stream));
                let end = match end {
                    Some(end) => end,
                    None => logs::current_len(tail.path()).unwrap_or(0),
                };
                while tail.committed_offset() < end
                    && self
                        .scan_batch(id, &name, stream, &mut tail, &mut missing, end)
                        .await
                {}
                break;
            }
            self.scan_batch(id, &name, stream, &mut tail, &mut missing, u64::MAX)
                .await;
        }
    }

    /// Read and scan one batch ending before `end`. Returns whether any lines were read.
    async fn scan_batch(
        &self,
        id: BotId,
        name: &str,
        stream: LogStream,
        tail: &mut LogTail,
        missing: &mut bool,
        end: u64,
    ) -> bool {
        let lines = match tail.read_lines_before(end).await {
            Ok(lines) => {
                if *missing {
                    info!("{} log of {} is readable again", stream.as_str(), name);
                    *missing = false;
                }
                lines
            }
            Err(e) => {
                if !*missing {
                    warn!(
                        "Cannot read {} log of {} at {}: {}",
                        stream.as_str(),
                        name,
                        tail.path().display(),
                        e
                    );
                    *missing = true;
                }
                return false;
            }
        };
        if lines.is_empty() {
            return false;
        }

        let matched = lines
            .iter()
            .filter(|line| self.signatures.is_match(line))
            .count();
        if matched > 0 {
            let decision = self
                .debouncer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .admit(id, matched, tokio::time::Instant::now());
            match decision {
                Some(suppressed) => {
                    let body = self.alert_body(stream, matched, suppressed, &lines);
                    self.dispatcher
                        .spawn(Alert::for_bot(name, AlertKind::ErrorLog, body));
                }
                None => debug!("Suppressed {} matching line(s) from {}", matched, name),
            }
        }

        if let Err(e) = self
            .registry
            .save_offset(id, stream, tail.committed_offset())
            .await
        {
            warn!("Could not persist {} offset for {}: {}", stream.as_str(), name, e);
        }
        true
    }

    fn alert_body(
        &self,
        stream: LogStream,
        matched: usize,
        suppressed: usize,
        lines: &[String],
    ) -> String {
        let mut body = format!("{} matching line(s) in {}", matched, stream.as_str());
        if suppressed > 0 {
            body.push_str(&format!(
                ", {} more suppressed since the last alert",
                suppressed
            ));
        }
        let start = lines.len().saturating_sub(self.excerpt_lines);
        body.push_str("\n\n");
        body.push_str(&lines[start..].join("\n"));
        body
    }
}
