//! The two stages a segment goes through before it can be appended: the
//! network stage, which honours cancellation, and the processing stage,
//! which always runs to completion once started.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::crypto::decrypt_aes128_cbc;
use crate::error::{LoaderError, RequestError};
use crate::events::{EventEmitter, LoaderEvent};
use crate::loader::segment::Processed;
use crate::transmux::{self, TrackInfo, TransmuxJob, Transmuxer};
use crate::transport::{HttpTransport, MediaRequest, MediaResponse};

/// Requests issued for one segment. Key and init segment requests are left
/// out when their bytes are cached.
#[derive(Debug, Clone)]
pub(crate) struct FetchPlan {
    pub segment: MediaRequest,
    pub key: Option<MediaRequest>,
    pub init: Option<MediaRequest>,
}

#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub segment: MediaResponse,
    pub key: Option<MediaResponse>,
    pub init: Option<MediaResponse>,
}

async fn optional_request(
    transport: &dyn HttpTransport,
    request: Option<MediaRequest>,
) -> Result<Option<MediaResponse>, RequestError> {
    match request {
        Some(request) => transport.request(request, None).await.map(Some),
        None => Ok(None),
    }
}

/// Issue the segment request and its key/init requests in parallel,
/// forwarding segment download progress as loader events.
pub(crate) fn fetch(
    transport: Arc<dyn HttpTransport>,
    plan: FetchPlan,
    events: EventEmitter,
    token: CancellationToken,
) -> BoxFuture<'static, Result<Fetched, RequestError>> {
    Box::pin(async move {
        let uri = plan.segment.uri.clone();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let requests = async {
            let result = futures::try_join!(
                transport.request(plan.segment, Some(progress_tx)),
                optional_request(transport.as_ref(), plan.key),
                optional_request(transport.as_ref(), plan.init),
            );
            result.map(|(segment, key, init)| Fetched { segment, key, init })
        };

        let forward_progress = async {
            while let Some(progress) = progress_rx.recv().await {
                events.emit(LoaderEvent::Progress {
                    uri: progress.uri,
                    bytes_received: progress.bytes_received,
                });
            }
        };

        let work = async {
            let (result, ()) = tokio::join!(requests, forward_progress);
            result
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(uri = %uri, "Request cancelled");
                Err(RequestError::Aborted(uri))
            }
            result = work => result,
        }
    })
}

/// Decryption input: key bytes and the IV for this segment.
#[derive(Debug, Clone)]
pub(crate) struct KeyMaterial {
    pub key: Bytes,
    pub iv: [u8; 16],
}

#[derive(Debug, Clone)]
pub(crate) struct InitMaterial {
    pub id: String,
    pub bytes: Bytes,
    /// Already probed track info, if any.
    pub track_info: Option<TrackInfo>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProcessJob {
    pub uri: String,
    pub bytes: Bytes,
    pub key: Option<KeyMaterial>,
    pub init: Option<InitMaterial>,
    pub timeline: u64,
    pub duration: f64,
}

/// Decrypt, probe the init segment when needed, and transmux.
pub(crate) fn process(
    transmuxer: Arc<dyn Transmuxer>,
    job: ProcessJob,
) -> BoxFuture<'static, Result<Processed, LoaderError>> {
    Box::pin(async move {
        let bytes = match &job.key {
            Some(material) => decrypt_aes128_cbc(&job.bytes, &material.key, &material.iv)
                .map_err(|e| LoaderError::from(e).with_uri(job.uri.clone()))?,
            None => job.bytes.clone(),
        };

        let mut probed = None;
        let mut init_track_info = None;
        if let Some(init) = &job.init {
            init_track_info = match init.track_info {
                Some(info) => Some(info),
                None => {
                    let info = transmuxer
                        .probe_init_segment(init.bytes.clone())
                        .await
                        .map_err(|e| LoaderError::from(e).with_uri(init.id.clone()))?;
                    trace!(init = %init.id, ?info, "Probed init segment");
                    probed = Some(info);
                    Some(info)
                }
            };
        }

        let rx = transmuxer.push(TransmuxJob {
            bytes,
            init: init_track_info,
            timeline: job.timeline,
            duration: job.duration,
        });
        let transmuxed = transmux::collect(rx)
            .await
            .map_err(|e| LoaderError::from(e).with_uri(job.uri.clone()))?;

        Ok(Processed {
            transmuxed,
            init: job.init.map(|init| (init.id, init.bytes)),
            probed,
        })
    })
}
