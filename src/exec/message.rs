//! Typed request/reply protocol between the orchestrating and executing
//! contexts.
//!
//! The two contexts never share memory; everything crosses as an owned
//! [`Envelope`]. The orchestrator talks to the worker through a
//! [`WorkerLink`], correlating each request with its reply by
//! [`CorrelationKey`]. The worker talks back (replies, plus its own `read`
//! and `seek` requests issued mid-operation) through a [`HostLink`].
//!
//! Correlation is by key, not by sequence number: issuing a second request
//! with the same key while the first is outstanding supersedes the first
//! listener, which observes a protocol error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::engine_api::OutputChunk;
use crate::foundation::error::{ClipflowError, ClipflowResult, ErrorKind};
use crate::graph::build::{GraphInstance, InstanceId};
use crate::graph::metadata::{FormatMetadata, StreamMetadata};
use crate::graph::node::{SourceId, SourceShape};

/// Discriminant of a [`Request`], used for reply correlation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Probe a source's container and stream metadata.
    GetMetadata,
    /// Instantiate a compiled graph in the executing context.
    BuildGraph,
    /// Pull one chunk of source bytes (worker → orchestrator).
    Read,
    /// Reposition a source (worker → orchestrator).
    Seek,
    /// Run one execution step.
    NextFrame,
    /// Tear down the current graph.
    DeleteGraph,
}

/// Key a reply is matched against its request with.
///
/// Per-source requests carry the source id so that concurrent requests for
/// different sources do not collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Which operation the request was.
    pub kind: RequestKind,
    /// The source the request concerns, when it concerns one.
    pub source: Option<SourceId>,
}

/// A request crossing between contexts.
#[derive(Clone, Debug)]
pub enum Request {
    /// Probe a source: open a demuxer over the host-fed bytes and return
    /// what the container declares.
    GetMetadata {
        /// Source to probe.
        source: SourceId,
        /// Its delivery shape.
        shape: SourceShape,
    },
    /// Instantiate the compiled graph.
    BuildGraph {
        /// The graph to run.
        graph: GraphInstance,
    },
    /// Worker-issued: pull the next chunk of a source's bytes.
    Read {
        /// Source to pull from.
        source: SourceId,
    },
    /// Worker-issued: reposition a source.
    Seek {
        /// Source to reposition.
        source: SourceId,
        /// Absolute byte offset.
        pos: u64,
    },
    /// Run one step, delivering fresh input first.
    NextFrame {
        /// New chunks per source, for sources reported starved last step.
        inputs: HashMap<SourceId, Vec<Bytes>>,
        /// Sources whose byte stream is fully delivered.
        ended: HashSet<SourceId>,
    },
    /// Tear down the current graph. Tolerated when no graph is live.
    DeleteGraph,
}

impl Request {
    /// The correlation key this request's reply will carry.
    pub fn key(&self) -> CorrelationKey {
        let (kind, source) = match self {
            Self::GetMetadata { source, .. } => (RequestKind::GetMetadata, Some(*source)),
            Self::BuildGraph { .. } => (RequestKind::BuildGraph, None),
            Self::Read { source } => (RequestKind::Read, Some(*source)),
            Self::Seek { source, .. } => (RequestKind::Seek, Some(*source)),
            Self::NextFrame { .. } => (RequestKind::NextFrame, None),
            Self::DeleteGraph => (RequestKind::DeleteGraph, None),
        };
        CorrelationKey { kind, source }
    }
}

/// What one execution step produced.
#[derive(Clone, Debug, Default)]
pub struct StepReport {
    /// Output chunks per target, drained this step.
    pub outputs: HashMap<InstanceId, Vec<OutputChunk>>,
    /// Sources whose input buffer ran dry and that still expect bytes.
    pub starved: Vec<SourceId>,
    /// Every source is exhausted and the step produced no frames; targets
    /// are finalized.
    pub end: bool,
}

/// A reply crossing between contexts.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Probed metadata for [`Request::GetMetadata`].
    Metadata {
        /// Container-level metadata.
        container: FormatMetadata,
        /// Per-stream metadata in container order.
        streams: Vec<StreamMetadata>,
    },
    /// The graph is instantiated.
    GraphBuilt,
    /// One chunk of source bytes, `None` at end of source.
    Chunk(Option<Bytes>),
    /// The source was repositioned.
    SeekDone,
    /// Step results.
    Step(StepReport),
    /// The graph is gone.
    GraphDeleted,
    /// The request failed in the other context.
    Failed {
        /// Classified failure kind.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
}

/// An envelope on either channel.
#[derive(Clone, Debug)]
pub enum Envelope {
    /// A request awaiting a reply.
    Request(Request),
    /// A reply to an earlier request with the same key.
    Reply {
        /// Key of the request being answered.
        key: CorrelationKey,
        /// The reply payload.
        reply: Reply,
    },
    /// Orchestrator shutdown; the worker stops serving and exits.
    ///
    /// Needed as an explicit signal because both the session and its reply
    /// dispatcher hold sender halves, so channel closure alone cannot
    /// signal the worker while the dispatcher is still draining.
    Shutdown,
}

type PendingMap = Arc<Mutex<HashMap<CorrelationKey, oneshot::Sender<Reply>>>>;

/// Orchestrator-side handle to the worker.
#[derive(Clone)]
pub struct WorkerLink {
    to_worker: mpsc::Sender<Envelope>,
    pending: PendingMap,
}

impl WorkerLink {
    /// Send a request and await its reply.
    ///
    /// If a request with the same key is already outstanding its listener
    /// is superseded and observes a [`ClipflowError::Protocol`] error; the
    /// newer call owns the eventual reply.
    pub async fn send(&self, request: Request) -> ClipflowResult<Reply> {
        let key = request.key();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            if pending.insert(key, tx).is_some() {
                tracing::debug!(?key, "outstanding request superseded");
            }
        }
        self.to_worker
            .send(Envelope::Request(request))
            .map_err(|_| ClipflowError::protocol("executing context is gone"))?;
        match rx.await {
            Ok(Reply::Failed { kind, message }) => Err(ClipflowError::from_kind(kind, message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(ClipflowError::protocol(format!(
                "request {key:?} superseded by a newer request with the same key"
            ))),
        }
    }

    /// Resolve a pending request with its reply. Replies with no listener
    /// are dropped with a warning.
    pub(crate) fn complete(&self, key: CorrelationKey, reply: Reply) {
        let listener = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&key);
        match listener {
            // the listener may have been dropped; nothing to do then
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!(?key, "reply with no pending listener dropped"),
        }
    }

    /// Deliver a reply to a worker-issued request.
    pub(crate) fn post_reply(&self, key: CorrelationKey, reply: Reply) {
        let _ = self.to_worker.send(Envelope::Reply { key, reply });
    }

    /// Tell the worker to stop serving and exit its thread.
    pub(crate) fn shutdown(&self) {
        let _ = self.to_worker.send(Envelope::Shutdown);
    }
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink").finish_non_exhaustive()
    }
}

/// Worker-side handle to the orchestrator.
///
/// The worker is single threaded; [`HostLink::call`] blocks it until the
/// matching reply arrives, queuing any orchestrator requests that come in
/// while it waits.
#[derive(Clone)]
pub struct HostLink {
    to_host: async_mpsc::UnboundedSender<Envelope>,
    from_host: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    queued: Arc<Mutex<VecDeque<Request>>>,
    closing: Arc<AtomicBool>,
}

impl HostLink {
    /// The next orchestrator request, or `None` once the orchestrator side
    /// shut down or is gone. Requests queued during a
    /// [`call`](Self::call) are drained first.
    pub fn recv(&self) -> Option<Request> {
        if let Some(queued) = self
            .queued
            .lock()
            .expect("request queue lock poisoned")
            .pop_front()
        {
            return Some(queued);
        }
        if self.closing.load(Ordering::Acquire) {
            return None;
        }
        loop {
            let envelope = self
                .from_host
                .lock()
                .expect("channel lock poisoned")
                .recv()
                .ok()?;
            match envelope {
                Envelope::Request(request) => return Some(request),
                Envelope::Reply { key, .. } => {
                    tracing::warn!(?key, "reply with no call in flight dropped");
                }
                Envelope::Shutdown => return None,
            }
        }
    }

    /// Answer an orchestrator request.
    pub fn reply(&self, key: CorrelationKey, reply: Reply) {
        let _ = self.to_host.send(Envelope::Reply { key, reply });
    }

    /// Issue a request to the orchestrator and block until it is answered.
    pub fn call(&self, request: Request) -> ClipflowResult<Reply> {
        let key = request.key();
        self.to_host
            .send(Envelope::Request(request))
            .map_err(|_| ClipflowError::protocol("orchestrating context is gone"))?;
        loop {
            let envelope = self
                .from_host
                .lock()
                .expect("channel lock poisoned")
                .recv()
                .map_err(|_| ClipflowError::protocol("orchestrating context is gone"))?;
            match envelope {
                Envelope::Reply { key: got, reply } if got == key => {
                    return match reply {
                        Reply::Failed { kind, message } => {
                            Err(ClipflowError::from_kind(kind, message))
                        }
                        reply => Ok(reply),
                    };
                }
                Envelope::Reply { key: got, .. } => {
                    tracing::warn!(?got, expected = ?key, "mismatched reply dropped");
                }
                Envelope::Request(request) => {
                    self.queued
                        .lock()
                        .expect("request queue lock poisoned")
                        .push_back(request);
                }
                Envelope::Shutdown => {
                    self.closing.store(true, Ordering::Release);
                    return Err(ClipflowError::protocol("orchestrating context shut down"));
                }
            }
        }
    }
}

impl std::fmt::Debug for HostLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLink").finish_non_exhaustive()
    }
}

/// Build the channel pair connecting the two contexts.
///
/// Returns the orchestrator's [`WorkerLink`], the worker's [`HostLink`],
/// and the stream of worker-to-orchestrator envelopes the orchestrator's
/// dispatcher consumes.
pub(crate) fn link_pair() -> (WorkerLink, HostLink, async_mpsc::UnboundedReceiver<Envelope>) {
    let (to_worker, from_host) = mpsc::channel();
    let (to_host, from_worker) = async_mpsc::unbounded_channel();
    let worker_link = WorkerLink {
        to_worker,
        pending: Arc::new(Mutex::new(HashMap::new())),
    };
    let host_link = HostLink {
        to_host,
        from_host: Arc::new(Mutex::new(from_host)),
        queued: Arc::new(Mutex::new(VecDeque::new())),
        closing: Arc::new(AtomicBool::new(false)),
    };
    (worker_link, host_link, from_worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forward worker replies into the pending map, as the session
    /// dispatcher does.
    fn spawn_dispatcher(
        link: WorkerLink,
        mut from_worker: async_mpsc::UnboundedReceiver<Envelope>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = from_worker.recv().await {
                if let Envelope::Reply { key, reply } = envelope {
                    link.complete(key, reply);
                }
            }
        })
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (link, host, from_worker) = link_pair();
        let worker = std::thread::spawn(move || {
            while let Some(request) = host.recv() {
                let key = request.key();
                host.reply(key, Reply::GraphDeleted);
            }
        });
        spawn_dispatcher(link.clone(), from_worker);

        let reply = link.send(Request::DeleteGraph).await.unwrap();
        assert!(matches!(reply, Reply::GraphDeleted));
        link.shutdown();
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn failed_reply_surfaces_as_classified_error() {
        let (link, host, from_worker) = link_pair();
        let worker = std::thread::spawn(move || {
            while let Some(request) = host.recv() {
                host.reply(
                    request.key(),
                    Reply::Failed {
                        kind: ErrorKind::Engine,
                        message: "no such codec".into(),
                    },
                );
            }
        });
        spawn_dispatcher(link.clone(), from_worker);

        let err = link.send(Request::DeleteGraph).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert!(err.to_string().contains("no such codec"));
        link.shutdown();
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn second_request_with_same_key_supersedes_the_first() {
        let (link, host, from_worker) = link_pair();
        // Answer only after both copies of the request arrived, so the
        // first listener is deterministically superseded before any reply
        // exists.
        let worker = std::thread::spawn(move || {
            let first = host.recv().unwrap();
            let second = host.recv().unwrap();
            assert_eq!(first.key(), second.key());
            host.reply(second.key(), Reply::GraphDeleted);
        });
        spawn_dispatcher(link.clone(), from_worker);

        let first_link = link.clone();
        let first = tokio::spawn(async move { first_link.send(Request::DeleteGraph).await });
        // let the first request register its listener before the second
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = link.send(Request::DeleteGraph).await;
        assert!(matches!(second, Ok(Reply::GraphDeleted)));

        let first = first.await.unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("superseded"));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn worker_call_queues_interleaved_requests() {
        let (link, host, from_worker) = link_pair();
        let worker = std::thread::spawn(move || {
            // first request triggers a nested call back to the host
            let request = host.recv().unwrap();
            let chunk = host
                .call(Request::Read {
                    source: SourceId(0),
                })
                .unwrap();
            assert!(matches!(chunk, Reply::Chunk(Some(_))));
            host.reply(request.key(), Reply::GraphBuilt);
            // the request that arrived mid-call must still be delivered
            let queued = host.recv().unwrap();
            host.reply(queued.key(), Reply::GraphDeleted);
        });
        let dispatcher_link = link.clone();
        let mut from_worker = from_worker;
        tokio::spawn(async move {
            while let Some(envelope) = from_worker.recv().await {
                match envelope {
                    Envelope::Reply { key, reply } => dispatcher_link.complete(key, reply),
                    Envelope::Request(request) => {
                        let key = request.key();
                        dispatcher_link.post_reply(key, Reply::Chunk(Some(Bytes::from_static(b"x"))));
                    }
                    Envelope::Shutdown => {}
                }
            }
        });

        let build_link = link.clone();
        let graph_handle = tokio::spawn(async move {
            // any BuildGraph payload works; the stub worker never looks at it
            build_link
                .send(Request::BuildGraph {
                    graph: GraphInstance {
                        nodes: vec![],
                        sources: vec![],
                        filters: vec![],
                        targets: vec![],
                        filter_layout: None,
                    },
                })
                .await
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let deleted = link.send(Request::DeleteGraph).await.unwrap();
        assert!(matches!(deleted, Reply::GraphDeleted));
        assert!(matches!(graph_handle.await.unwrap(), Ok(Reply::GraphBuilt)));
        worker.join().unwrap();
    }
}
