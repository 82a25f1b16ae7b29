//! Pipeline run and version handlers.

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use ciwi_core::ids::PipelineDbId;
use ciwi_core::source::{ResolveEvent, ResolvedVersion};
use ciwi_scheduler::{EnqueueResponse, Selection, VersionPreview};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::error::{ApiJson, ApiResult, parse_id};
use crate::state::AppState;

fn pipeline_id(raw: &str) -> ApiResult<PipelineDbId> {
    parse_id(raw, "pipeline id")
}

pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EnqueueResponse>> {
    let id = pipeline_id(&id)?;
    let response = state.enqueue.run_pipeline(id, &Selection::default()).await?;
    info!(
        pipeline_id = ?response.pipeline_id,
        jobs = response.job_execution_ids.len(),
        "pipeline run enqueued"
    );
    Ok(Json(response))
}

pub async fn run_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(selection): ApiJson<Selection>,
) -> ApiResult<Json<EnqueueResponse>> {
    let id = pipeline_id(&id)?;
    let response = state.enqueue.run_pipeline(id, &selection).await?;
    info!(
        pipeline_id = ?response.pipeline_id,
        jobs = response.job_execution_ids.len(),
        dry_run = selection.dry_run,
        "pipeline selection enqueued"
    );
    Ok(Json(response))
}

pub async fn version_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VersionPreview>> {
    Ok(Json(state.enqueue.version_preview(pipeline_id(&id)?).await?))
}

/// Messages carried on the resolve stream.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum StreamMessage {
    Step(ResolveEvent),
    Done { done: bool, version: ResolvedVersion },
    Failed { done: bool, error: String },
}

impl StreamMessage {
    fn event_name(&self) -> &'static str {
        match self {
            StreamMessage::Step(_) => "step",
            StreamMessage::Done { .. } => "done",
            StreamMessage::Failed { .. } => "error",
        }
    }

    fn into_event(self) -> Event {
        let name = self.event_name();
        match Event::default().event(name).json_data(&self) {
            Ok(event) => event,
            Err(e) => Event::default().event("error").data(e.to_string()),
        }
    }
}

/// Aborts the resolve task when the client goes away.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Stream each resolve sub-step as a server-sent event, then a final
/// `done` or `error` event.
pub async fn version_resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = pipeline_id(&id)?;
    let (tx, rx) = mpsc::unbounded_channel::<StreamMessage>();

    let task = tokio::spawn(async move {
        let step_tx = tx.clone();
        let report = move |event: ResolveEvent| {
            let _ = step_tx.send(StreamMessage::Step(event));
        };
        let outcome = state.enqueue.resolve_version(id, &report).await;
        let last = match outcome {
            Ok(version) => StreamMessage::Done {
                done: true,
                version,
            },
            Err(e) => StreamMessage::Failed {
                done: true,
                error: e.to_string(),
            },
        };
        debug!(pipeline_db_id = %id, event = last.event_name(), "version resolve finished");
        let _ = tx.send(last);
    });

    let guard = AbortOnDrop(task);
    let stream = UnboundedReceiverStream::new(rx).map(move |message| {
        let _ = &guard;
        Ok(message.into_event())
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
