//! The executing context: a dedicated thread owning the media engine.
//!
//! The thread serves one request at a time, in arrival order, and holds at
//! most one live [`GraphRuntime`]. Failures never kill the thread; they are
//! reported back as [`Reply::Failed`] and the loop keeps serving. The
//! thread exits when the orchestrator side of the channel is gone.

use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::engine_api::MediaEngine;
use crate::exec::message::{Envelope, HostLink, Reply, Request, WorkerLink, link_pair};
use crate::exec::runtime::{GraphRuntime, probe_input};
use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::node::{SourceId, SourceShape};

/// Spawn the executing context on its own thread.
pub(crate) fn spawn(
    engine: Box<dyn MediaEngine>,
) -> (WorkerLink, UnboundedReceiver<Envelope>, JoinHandle<()>) {
    let (worker_link, host_link, from_worker) = link_pair();
    let handle = std::thread::Builder::new()
        .name("clipflow-worker".into())
        .spawn(move || run(engine, host_link))
        .expect("failed to spawn worker thread");
    (worker_link, from_worker, handle)
}

fn run(engine: Box<dyn MediaEngine>, link: HostLink) {
    let mut runtime: Option<GraphRuntime> = None;
    while let Some(request) = link.recv() {
        let key = request.key();
        let reply = match handle(request, engine.as_ref(), &mut runtime, &link) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(?key, error = %err, "request failed");
                Reply::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        };
        link.reply(key, reply);
    }
    tracing::debug!("worker channel closed, shutting down");
}

fn handle(
    request: Request,
    engine: &dyn MediaEngine,
    runtime: &mut Option<GraphRuntime>,
    link: &HostLink,
) -> ClipflowResult<Reply> {
    match request {
        Request::GetMetadata { source, shape } => probe_metadata(engine, link, source, &shape),
        Request::BuildGraph { graph } => {
            // a still-live previous runtime is dropped with its engine objects
            *runtime = Some(GraphRuntime::build(engine, &graph, link)?);
            Ok(Reply::GraphBuilt)
        }
        Request::NextFrame { inputs, ended } => {
            let rt = runtime
                .as_mut()
                .ok_or_else(|| ClipflowError::protocol("next_frame with no graph built"))?;
            rt.push_inputs(inputs, &ended);
            Ok(Reply::Step(rt.step()?))
        }
        Request::DeleteGraph => {
            if runtime.take().is_none() {
                tracing::debug!("delete_graph with no graph, acknowledged");
            }
            Ok(Reply::GraphDeleted)
        }
        Request::Read { .. } | Request::Seek { .. } => Err(ClipflowError::protocol(
            "read and seek originate in the executing context",
        )),
    }
}

/// Open a short-lived demuxer over the source and return what the container
/// declares. Bytes are pumped over the channel for the whole probe.
fn probe_metadata(
    engine: &dyn MediaEngine,
    link: &HostLink,
    source: SourceId,
    shape: &SourceShape,
) -> ClipflowResult<Reply> {
    let size = match shape {
        SourceShape::Seekable { size, .. } => Some(*size),
        SourceShape::Live => None,
        SourceShape::FrameStream => {
            return Err(ClipflowError::protocol(
                "frame-stream sources declare their metadata and are never probed",
            ));
        }
    };
    let input = probe_input(source, size, link.clone());
    let mut demuxer = engine.open_demuxer(Box::new(input))?;
    let (container, streams) = demuxer.metadata()?;
    Ok(Reply::Metadata { container, streams })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use crate::engine_api::{
        ByteInput, Decoder, Demuxer, Encoder, FilterGraphSpec, Filterer, Muxer,
    };
    use crate::foundation::error::ErrorKind;
    use crate::graph::metadata::StreamMetadata;
    use crate::graph::node::ContainerSpec;

    /// An engine no request in these tests should ever reach.
    struct InertEngine;

    impl MediaEngine for InertEngine {
        fn open_demuxer(&self, _input: Box<dyn ByteInput>) -> ClipflowResult<Box<dyn Demuxer>> {
            Err(ClipflowError::engine("inert engine"))
        }
        fn new_decoder(
            &self,
            _stream: &StreamMetadata,
            _tag: &str,
        ) -> ClipflowResult<Box<dyn Decoder>> {
            Err(ClipflowError::engine("inert engine"))
        }
        fn new_filterer(&self, _spec: &FilterGraphSpec) -> ClipflowResult<Box<dyn Filterer>> {
            Err(ClipflowError::engine("inert engine"))
        }
        fn new_encoder(&self, _stream: &StreamMetadata) -> ClipflowResult<Box<dyn Encoder>> {
            Err(ClipflowError::engine("inert engine"))
        }
        fn new_muxer(
            &self,
            _container: &ContainerSpec,
            _streams: &[StreamMetadata],
        ) -> ClipflowResult<Box<dyn Muxer>> {
            Err(ClipflowError::engine("inert engine"))
        }
    }

    fn spawn_with_router() -> (WorkerLink, JoinHandle<()>) {
        let (link, mut from_worker, handle) = spawn(Box::new(InertEngine));
        let router = link.clone();
        tokio::spawn(async move {
            while let Some(envelope) = from_worker.recv().await {
                if let Envelope::Reply { key, reply } = envelope {
                    router.complete(key, reply);
                }
            }
        });
        (link, handle)
    }

    #[tokio::test]
    async fn delete_with_no_graph_is_acknowledged() {
        let (link, handle) = spawn_with_router();

        let reply = link.send(Request::DeleteGraph).await.unwrap();
        assert!(matches!(reply, Reply::GraphDeleted));
        // still an ack the second time
        let reply = link.send(Request::DeleteGraph).await.unwrap();
        assert!(matches!(reply, Reply::GraphDeleted));

        link.shutdown();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn next_frame_with_no_graph_is_a_protocol_error() {
        let (link, handle) = spawn_with_router();

        let err = link
            .send(Request::NextFrame {
                inputs: HashMap::new(),
                ended: HashSet::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        link.shutdown();
        handle.join().unwrap();
    }
}
